//! ASCII command dialect of the force stage firmware.

pub mod frame;
pub mod table;

pub use frame::{
    decode_line, labeled_value, parse_frame, parse_labeled, parse_labeled_pair, CommandFrame,
    FrameConfig, ResponseOutcome, Spacing, FAULT_SENTINEL,
};
pub use table::{ArgShape, CommandSpec, ProtocolRevision, ResponseShape};

/// Exact fault text the firmware sends to confirm an emergency stop.
///
/// For `ST` this line is the success signal. No other command treats a fault as success.
pub const STOP_CONFIRMATION: &str = "[ERROR]: movement aborted, home to unlock";

/// Time/force separator of a streaming header line (`": 0;1.5"`).
pub const HEADER_PAIR_SEPARATOR: char = ';';

/// Time/force separator of a streaming body line (`": 100,1.6"`).
pub const BODY_PAIR_SEPARATOR: char = ',';

/// Mnemonic guarded by the travel limits.
pub const MOVE_COMMAND: &str = "SP";
