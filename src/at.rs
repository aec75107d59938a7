//! Line-oriented AT command parsing and formatting.
//!
//! The RFCOMM channel of HFP and HSP carries classic AT traffic: the
//! hands-free side issues `AT+CMD=...` requests, the gateway answers
//! with `+CMD: ...` responses and `OK`/`ERROR` results, and either side
//! may emit unsolicited indicators. This module is purely lexical; the
//! protocol logic lives in [crate::rfcomm].

use std::fmt;

/// Final result code of an AT exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtResult {
    /// Command completed.
    Ok,
    /// Command failed.
    Error,
    /// Incoming call indicator.
    Ring,
}

impl fmt::Display for AtResult {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::Error => write!(f, "ERROR"),
            Self::Ring => write!(f, "RING"),
        }
    }
}

/// One parsed AT line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtMessage {
    /// `AT+CMD=value`: set command.
    Set {
        /// Command name including the leading `+`.
        command: String,
        /// Raw value text.
        value: String,
    },
    /// `AT+CMD?`: read command.
    Get {
        /// Command name including the leading `+`.
        command: String,
    },
    /// `AT+CMD=?`: test command.
    Test {
        /// Command name including the leading `+`.
        command: String,
    },
    /// `+CMD: value`, a response or unsolicited indicator.
    Response {
        /// Command name including the leading `+`.
        command: String,
        /// Raw value text.
        value: String,
    },
    /// `OK`, `ERROR` or `RING`.
    Result(AtResult),
    /// Anything else, forwarded verbatim.
    Raw(String),
}

impl AtMessage {
    /// Parse a single line, already stripped of CR/LF.
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        match line {
            "OK" => return Self::Result(AtResult::Ok),
            "ERROR" => return Self::Result(AtResult::Error),
            "RING" => return Self::Result(AtResult::Ring),
            _ => {}
        }

        if let Some(rest) = line.strip_prefix("AT") {
            if let Some(command) = rest.strip_suffix("=?") {
                return Self::Test { command: command.to_string() };
            }
            if let Some(command) = rest.strip_suffix('?') {
                return Self::Get { command: command.to_string() };
            }
            if let Some((command, value)) = rest.split_once('=') {
                return Self::Set { command: command.to_string(), value: value.to_string() };
            }
            // Bare execution command, e.g. ATA.
            return Self::Set { command: rest.to_string(), value: String::new() };
        }

        if line.starts_with('+') {
            if let Some((command, value)) = line.split_once(':') {
                return Self::Response { command: command.to_string(), value: value.trim().to_string() };
            }
        }

        Self::Raw(line.to_string())
    }

    /// Wire form of the message.
    ///
    /// Commands use a bare CR terminator, responses and results the
    /// CR-LF framing expected by hands-free units.
    pub fn to_wire(&self) -> String {
        match self {
            Self::Set { command, value } if value.is_empty() => format!("AT{command}\r"),
            Self::Set { command, value } => format!("AT{command}={value}\r"),
            Self::Get { command } => format!("AT{command}?\r"),
            Self::Test { command } => format!("AT{command}=?\r"),
            Self::Response { command, value } => format!("\r\n{command}:{value}\r\n"),
            Self::Result(result) => format!("\r\n{result}\r\n"),
            Self::Raw(text) => format!("\r\n{text}\r\n"),
        }
    }
}

/// Accumulates raw RFCOMM bytes and yields complete AT lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: String,
}

impl LineBuffer {
    /// Create an empty line buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; returns all lines completed by this chunk.
    ///
    /// Non-UTF-8 bytes are replaced, matching the tolerance of deployed
    /// hands-free units.
    pub fn feed(&mut self, data: &[u8]) -> Vec<String> {
        self.buf.push_str(&String::from_utf8_lossy(data));

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.find(['\r', '\n']) {
            let line = self.buf[..pos].to_string();
            self.buf.drain(..=pos);
            if !line.trim().is_empty() {
                lines.push(line);
            }
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_command_forms() {
        assert_eq!(
            AtMessage::parse("AT+BRSF=127"),
            AtMessage::Set { command: "+BRSF".into(), value: "127".into() }
        );
        assert_eq!(AtMessage::parse("AT+CIND?"), AtMessage::Get { command: "+CIND".into() });
        assert_eq!(AtMessage::parse("AT+CIND=?"), AtMessage::Test { command: "+CIND".into() });
        assert_eq!(AtMessage::parse("ATA"), AtMessage::Set { command: "A".into(), value: "".into() });
    }

    #[test]
    fn parse_responses_and_results() {
        assert_eq!(
            AtMessage::parse("+BCS: 2"),
            AtMessage::Response { command: "+BCS".into(), value: "2".into() }
        );
        assert_eq!(AtMessage::parse("OK"), AtMessage::Result(AtResult::Ok));
        assert_eq!(AtMessage::parse("ERROR"), AtMessage::Result(AtResult::Error));
        assert_eq!(AtMessage::parse("RING"), AtMessage::Result(AtResult::Ring));
        assert_eq!(AtMessage::parse("BUSY"), AtMessage::Raw("BUSY".into()));
    }

    #[test]
    fn wire_round_trip() {
        let msg = AtMessage::Set { command: "+VGS".into(), value: "7".into() };
        assert_eq!(msg.to_wire(), "AT+VGS=7\r");

        let msg = AtMessage::Response { command: "+BRSF".into(), value: " 1536".into() };
        assert_eq!(msg.to_wire(), "\r\n+BRSF: 1536\r\n");

        assert_eq!(AtMessage::Result(AtResult::Ok).to_wire(), "\r\nOK\r\n");
    }

    #[test]
    fn line_buffer_splits_mixed_framing() {
        let mut lb = LineBuffer::new();
        assert!(lb.feed(b"AT+BRSF=12").is_empty());
        assert_eq!(lb.feed(b"7\r"), vec!["AT+BRSF=127"]);
        assert_eq!(lb.feed(b"\r\nOK\r\nAT+BAC=1,2\r"), vec!["OK", "AT+BAC=1,2"]);
    }
}
