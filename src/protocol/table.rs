//! Versioned command tables.
//!
//! Each firmware revision is one static table mapping a mnemonic to its argument
//! shape, response shape, spacing convention and whether the input buffer is reset
//! before the frame goes out. The driver picks a table at construction time.

use super::frame::{CommandFrame, Spacing};
use crate::error::{DriverError, DriverResult};
use serde::{Deserialize, Serialize};

/// Arguments a command takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgShape {
    /// No arguments.
    None,
    /// One integer.
    Int,
    /// One finite float.
    Float,
    /// `0` or `1`.
    Bool,
    /// Two integers, e.g. `count,interval`.
    IntPair,
}

impl ArgShape {
    /// Number of rendered arguments.
    pub fn arity(&self) -> usize {
        match self {
            ArgShape::None => 0,
            ArgShape::Int | ArgShape::Float | ArgShape::Bool => 1,
            ArgShape::IntPair => 2,
        }
    }

    /// Check that one rendered argument parses as this shape.
    pub fn accepts(&self, arg: &str) -> bool {
        match self {
            ArgShape::None => false,
            ArgShape::Int | ArgShape::IntPair => arg.parse::<i64>().is_ok(),
            ArgShape::Float => arg.parse::<f64>().map(f64::is_finite).unwrap_or(false),
            ArgShape::Bool => matches!(arg, "0" | "1"),
        }
    }
}

/// What a successful response line carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    /// Any non-fault line acknowledges the command.
    Ack,
    /// Integer after `": "`.
    LabeledInt,
    /// Float after `": "`.
    LabeledFloat,
    /// Whole line as text.
    Text,
    /// Last whitespace-separated word.
    Word,
    /// `<time>;<force>` after `": "`.
    LabeledPair,
    /// Only the stop confirmation fault counts as success.
    StopConfirmation,
    /// Header line followed by `count` body lines.
    Stream,
}

/// One row of a command table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    /// Two-letter mnemonic.
    pub mnemonic: &'static str,
    /// Argument shape.
    pub args: ArgShape,
    /// Response shape.
    pub response: ResponseShape,
    /// Mnemonic/argument spacing.
    pub spacing: Spacing,
    /// Reset the input buffer before sending.
    pub drain_before: bool,
}

impl CommandSpec {
    const fn new(mnemonic: &'static str, args: ArgShape, response: ResponseShape) -> Self {
        Self {
            mnemonic,
            args,
            response,
            spacing: Spacing::Spaced,
            drain_before: false,
        }
    }

    const fn drained(mut self) -> Self {
        self.drain_before = true;
        self
    }

    /// Build a frame for this command from already-rendered arguments.
    ///
    /// # Errors
    /// [`DriverError::InvalidArgument`] on wrong arity or an argument that does not
    /// parse as the declared shape.
    pub fn frame<I, S>(&self, args: I) -> DriverResult<CommandFrame>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        if args.len() != self.args.arity() {
            return Err(DriverError::InvalidArgument(format!(
                "{} takes {} argument(s), got {}",
                self.mnemonic,
                self.args.arity(),
                args.len()
            )));
        }
        if let Some(bad) = args.iter().find(|a| !self.args.accepts(a)) {
            return Err(DriverError::InvalidArgument(format!(
                "{} argument '{}' is not {:?}",
                self.mnemonic, bad, self.args
            )));
        }
        Ok(args
            .into_iter()
            .fold(CommandFrame::new(self.mnemonic), CommandFrame::arg)
            .with_spacing(self.spacing))
    }
}

use ArgShape as A;
use ResponseShape as R;

static CURRENT: &[CommandSpec] = &[
    CommandSpec::new("SP", A::Int, R::Ack).drained(),
    CommandSpec::new("GP", A::None, R::LabeledInt),
    CommandSpec::new("SV", A::Int, R::Ack).drained(),
    CommandSpec::new("GV", A::None, R::LabeledInt),
    CommandSpec::new("HM", A::None, R::Ack),
    CommandSpec::new("ST", A::None, R::StopConfirmation),
    CommandSpec::new("TR", A::None, R::Ack),
    CommandSpec::new("SF", A::Float, R::Ack),
    CommandSpec::new("SR", A::None, R::LabeledFloat).drained(),
    CommandSpec::new("CR", A::IntPair, R::Stream),
    CommandSpec::new("DC", A::Bool, R::Ack),
    CommandSpec::new("VR", A::None, R::Text),
    CommandSpec::new("ID", A::None, R::Text),
];

static LEGACY: &[CommandSpec] = &[
    CommandSpec::new("SP", A::Int, R::Ack),
    CommandSpec::new("GP", A::None, R::LabeledInt),
    CommandSpec::new("SV", A::Int, R::Ack),
    CommandSpec::new("GV", A::None, R::LabeledInt),
    CommandSpec::new("GM", A::None, R::Word),
    CommandSpec::new("TM", A::None, R::Ack),
    CommandSpec::new("SR", A::None, R::LabeledFloat),
    CommandSpec::new("CR", A::IntPair, R::Stream),
    CommandSpec::new("HM", A::None, R::Ack),
    CommandSpec::new("TR", A::None, R::Ack),
    CommandSpec::new("CL", A::None, R::Ack),
    CommandSpec::new("SF", A::Float, R::Ack),
    CommandSpec::new("SC", A::None, R::Ack),
    CommandSpec::new("CC", A::Int, R::LabeledPair),
];

/// Firmware dialect selected at driver construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolRevision {
    /// Early firmware with mode toggling, flash save and the debug CC command.
    Legacy,
    /// Firmware with stop, display control and identification queries.
    #[default]
    Current,
}

impl ProtocolRevision {
    /// Human-readable revision name.
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolRevision::Legacy => "legacy",
            ProtocolRevision::Current => "current",
        }
    }

    /// Every command of this revision.
    pub fn commands(&self) -> &'static [CommandSpec] {
        match self {
            ProtocolRevision::Legacy => LEGACY,
            ProtocolRevision::Current => CURRENT,
        }
    }

    /// Look up a mnemonic.
    ///
    /// # Errors
    /// [`DriverError::Unsupported`] if the revision does not define it.
    pub fn lookup(&self, mnemonic: &str) -> DriverResult<&'static CommandSpec> {
        self.commands()
            .iter()
            .find(|spec| spec.mnemonic == mnemonic)
            .ok_or_else(|| DriverError::Unsupported {
                command: mnemonic.to_string(),
                revision: self.name(),
            })
    }
}

impl std::fmt::Display for ProtocolRevision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
