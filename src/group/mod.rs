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

//! Group messaging: membership, key distribution, real-time delivery.

mod ack;
mod info;
mod messaging;
mod service;
mod types;

pub use ack::{
    AckCycleStats, AckError, ControlMessageSender, ControlSendError, GroupAckRepublisher,
    OfflineControlSender, PairwiseSecrets, StaticPairwiseSecrets,
};
pub use info::{GroupInfoPublisher, GroupInfoReader, InfoPublishError};
pub use messaging::{GroupMessenger, MessageEvent, SendError, SendOutcome, derive_topic};
pub use service::{EpochKeyWrapper, GroupService, GroupServiceError};
pub use types::{
    GroupChatKind, GroupChatMessage, GroupInvite, GroupInviteResponse, GroupMessageType,
    GroupStateUpdate, GroupWelcome,
};
