// Copyright (c) 2025 Saorsa Labs Limited

// This file is part of the Saorsa P2P network.

// Licensed under the AGPL-3.0 license:
// <https://www.gnu.org/licenses/agpl-3.0.html>

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Generic DHT put: drain the query event stream and call the put good
//! if at least one peer stored the record. Retry policy belongs to the
//! caller.

use futures::StreamExt;
use serde::Serialize;
use tracing::debug;

use super::{Dht, DhtError, PutQueryEvent};

/// Put raw bytes, succeeding once any peer acknowledges storage.
pub async fn put_record(dht: &dyn Dht, key: Vec<u8>, value: Vec<u8>) -> Result<(), DhtError> {
    let key_str = String::from_utf8_lossy(&key).to_string();
    let mut events = dht.put_query(key, value).await?;

    let mut responses = 0usize;
    let mut errors = 0usize;
    while let Some(event) = events.next().await {
        match event {
            PutQueryEvent::PeerResponse { .. } => responses += 1,
            PutQueryEvent::QueryError { peer, message } => {
                errors += 1;
                debug!(%key_str, %peer, %message, "put query error");
            }
        }
    }

    if responses == 0 {
        return Err(DhtError::NoPeerResponses { errors });
    }
    debug!(%key_str, responses, errors, "dht put complete");
    Ok(())
}

/// Serialize `value` as JSON and put it. Short-circuits without issuing
/// the query when the node has no live connections.
pub async fn put_json_record<T: Serialize>(
    dht: &dyn Dht,
    key: Vec<u8>,
    value: &T,
) -> Result<(), DhtError> {
    if dht.connected_peer_count().await == 0 {
        return Err(DhtError::NoConnectedPeers);
    }
    put_record(dht, key, serde_json::to_vec(value)?).await
}
