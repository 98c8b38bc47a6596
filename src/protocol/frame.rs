//! Frame codec: command frames out, response lines in.
//!
//! Outgoing frames have the shape `<start><NAME>[ ]<arg0>[<sep><arg1>...]<end>`, e.g.
//! `#SP 12;` or `#CR 100,50;`. Responses are single text lines; a line starting with the
//! `[ERROR]` sentinel is a device fault, everything else is a success payload whose
//! numeric part follows the first `": "`.
//!
//! Everything in this module is pure. I/O lives in [`crate::driver`].

use crate::error::{DriverError, DriverResult};
use std::fmt::Display;
use std::str::FromStr;

/// Prefix marking a device-reported fault line.
pub const FAULT_SENTINEL: &str = "[ERROR]";

/// Separator between a response label and its value.
pub const LABEL_SEPARATOR: &str = ": ";

/// Delimiter characters used to render and parse frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameConfig {
    /// First byte of every frame.
    pub start: char,
    /// Last byte of every frame.
    pub end: char,
    /// Separator between arguments.
    pub separator: char,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            start: '#',
            end: ';',
            separator: ',',
        }
    }
}

impl FrameConfig {
    fn is_reserved(&self, c: char) -> bool {
        c == self.start || c == self.end || c == self.separator || c.is_control()
    }
}

/// Whether a space separates the mnemonic from its first argument.
///
/// The firmware distinguishes `SP 5` from `SP5` positionally, so this is fixed per
/// command in the protocol table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Spacing {
    /// `#SP 5;`
    #[default]
    Spaced,
    /// `#SP5;`
    Compact,
}

/// One command ready to be rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    name: String,
    arguments: Vec<String>,
    spacing: Spacing,
}

impl CommandFrame {
    /// Frame without arguments.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arguments: Vec::new(),
            spacing: Spacing::default(),
        }
    }

    /// Append one argument, rendered with its `Display` impl.
    pub fn arg(mut self, value: impl Display) -> Self {
        self.arguments.push(value.to_string());
        self
    }

    /// Override the spacing convention.
    pub fn with_spacing(mut self, spacing: Spacing) -> Self {
        self.spacing = spacing;
        self
    }

    /// Command mnemonic.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rendered arguments in order.
    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    /// Spacing convention of this frame.
    pub fn spacing(&self) -> Spacing {
        self.spacing
    }

    /// Render the frame to text.
    ///
    /// # Errors
    /// [`DriverError::InvalidArgument`] if the mnemonic is not two ASCII letters or any
    /// argument is empty or contains a delimiter, whitespace or control character.
    pub fn render(&self, config: &FrameConfig) -> DriverResult<String> {
        if self.name.len() != 2 || !self.name.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(DriverError::InvalidArgument(format!(
                "mnemonic '{}' must be two ASCII letters",
                self.name
            )));
        }
        for arg in &self.arguments {
            if arg.is_empty() {
                return Err(DriverError::InvalidArgument(format!(
                    "empty argument to {}",
                    self.name
                )));
            }
            if let Some(bad) = arg
                .chars()
                .find(|c| config.is_reserved(*c) || c.is_whitespace())
            {
                return Err(DriverError::InvalidArgument(format!(
                    "argument '{}' to {} contains reserved character {:?}",
                    arg, self.name, bad
                )));
            }
        }

        let mut out = String::with_capacity(8 + self.arguments.iter().map(String::len).sum::<usize>());
        out.push(config.start);
        out.push_str(&self.name);
        if !self.arguments.is_empty() {
            if self.spacing == Spacing::Spaced {
                out.push(' ');
            }
            let sep = config.separator.to_string();
            out.push_str(&self.arguments.join(&sep));
        }
        out.push(config.end);
        Ok(out)
    }
}

/// Parse a frame as the instrument sees it.
///
/// Leading/trailing whitespace around the frame is ignored. Used by the simulated
/// instrument and by tests that inspect what the driver wrote.
pub fn parse_frame(text: &str, config: &FrameConfig) -> DriverResult<CommandFrame> {
    let body = text
        .trim()
        .strip_prefix(config.start)
        .and_then(|s| s.strip_suffix(config.end))
        .ok_or_else(|| {
            DriverError::InvalidArgument(format!("'{}' is not a delimited frame", text.trim()))
        })?;

    if body.len() < 2 || !body.is_char_boundary(2) {
        return Err(DriverError::InvalidArgument(format!(
            "frame '{}' has no mnemonic",
            text.trim()
        )));
    }
    let (name, rest) = body.split_at(2);
    let (spacing, rest) = match rest.strip_prefix(' ') {
        Some(stripped) => (Spacing::Spaced, stripped),
        None => (Spacing::Compact, rest),
    };

    let frame = CommandFrame::new(name).with_spacing(spacing);
    if rest.is_empty() {
        return Ok(frame);
    }
    Ok(rest
        .split(config.separator)
        .fold(frame, |frame, arg| frame.arg(arg)))
}

/// A response line classified by the fault sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// Any non-empty line not starting with `[ERROR]`.
    Success(String),
    /// The full `[ERROR]` line, verbatim.
    Fault(String),
}

impl ResponseOutcome {
    /// True if the device reported a fault.
    pub fn is_fault(&self) -> bool {
        matches!(self, ResponseOutcome::Fault(_))
    }

    /// Convert into the success payload, turning a fault into [`DriverError::DeviceFault`].
    pub fn into_payload(self) -> DriverResult<String> {
        match self {
            ResponseOutcome::Success(line) => Ok(line),
            ResponseOutcome::Fault(line) => Err(DriverError::DeviceFault(line)),
        }
    }
}

/// Classify one raw response line.
///
/// Surrounding whitespace and line terminators are trimmed. An empty line is a
/// [`DriverError::Decode`] ("no response"), never a success.
pub fn decode_line(command: &str, raw: &str) -> DriverResult<ResponseOutcome> {
    let line = raw.trim();
    if line.is_empty() {
        return Err(DriverError::decode(command, line, "no response"));
    }
    if line.starts_with(FAULT_SENTINEL) {
        Ok(ResponseOutcome::Fault(line.to_string()))
    } else {
        Ok(ResponseOutcome::Success(line.to_string()))
    }
}

/// Text after the first `": "` of a labeled response.
pub fn labeled_value<'a>(command: &str, line: &'a str) -> DriverResult<&'a str> {
    line.split_once(LABEL_SEPARATOR)
        .map(|(_, value)| value.trim())
        .ok_or_else(|| DriverError::decode(command, line, "missing ': ' label separator"))
}

/// Parse the labeled scalar of a response line.
pub fn parse_labeled<T>(command: &str, line: &str) -> DriverResult<T>
where
    T: FromStr,
    T::Err: Display,
{
    let value = labeled_value(command, line)?;
    value
        .parse::<T>()
        .map_err(|e| DriverError::decode(command, line, format!("'{}': {}", value, e)))
}

/// Parse a labeled `<time><sep><force>` pair.
///
/// Streaming headers use `;` and streaming body lines use `,`; the caller picks which.
pub fn parse_labeled_pair(command: &str, line: &str, separator: char) -> DriverResult<(i64, f64)> {
    let value = labeled_value(command, line)?;
    let (time, force) = value.split_once(separator).ok_or_else(|| {
        DriverError::decode(command, line, format!("expected '<time>{}<force>'", separator))
    })?;
    let time = time
        .trim()
        .parse::<i64>()
        .map_err(|e| DriverError::decode(command, line, format!("time field: {}", e)))?;
    let force = force
        .trim()
        .parse::<f64>()
        .map_err(|e| DriverError::decode(command, line, format!("force field: {}", e)))?;
    Ok((time, force))
}
