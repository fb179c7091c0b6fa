//! Message types and encoding/decoding for the coordinator/agent protocol
//!
//! ```text
//! SETTINGS <width> <height> <exposure_us>     C->A
//! TAKE_PHOTO <deadline_ns>                     C->A
//! PHOTO_TAKEN [<elapsed_ns>]                   A->C
//! RAM_LOW                                      A->C
//! CAPTURE_FAILED                               A->C
//! STOP_RECORD                                  C->A
//! RECORDING_STOPPED                            A->C
//! READY                                        A->C
//! ANOMALIES <agent> <r1,r2,...>                A->C
//! NO_ANOMALIES <agent>                         A->C
//! EXTRACTION_COMPLETE                          C->A
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use syncshot_core::{duration_as_nanos, AgentId, CaptureSettings, SyncError, SyncResult, Timestamp};

/// Frame terminator
pub const FRAME_TERMINATOR: u8 = b'\n';

/// Message keywords, also used by barriers to name the expected reply
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Keyword {
    Settings,
    TakePhoto,
    PhotoTaken,
    RamLow,
    CaptureFailed,
    StopRecord,
    RecordingStopped,
    Ready,
    Anomalies,
    NoAnomalies,
    ExtractionComplete,
}

impl Keyword {
    pub const ALL: [Keyword; 11] = [
        Keyword::Settings,
        Keyword::TakePhoto,
        Keyword::PhotoTaken,
        Keyword::RamLow,
        Keyword::CaptureFailed,
        Keyword::StopRecord,
        Keyword::RecordingStopped,
        Keyword::Ready,
        Keyword::Anomalies,
        Keyword::NoAnomalies,
        Keyword::ExtractionComplete,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Keyword::Settings => "SETTINGS",
            Keyword::TakePhoto => "TAKE_PHOTO",
            Keyword::PhotoTaken => "PHOTO_TAKEN",
            Keyword::RamLow => "RAM_LOW",
            Keyword::CaptureFailed => "CAPTURE_FAILED",
            Keyword::StopRecord => "STOP_RECORD",
            Keyword::RecordingStopped => "RECORDING_STOPPED",
            Keyword::Ready => "READY",
            Keyword::Anomalies => "ANOMALIES",
            Keyword::NoAnomalies => "NO_ANOMALIES",
            Keyword::ExtractionComplete => "EXTRACTION_COMPLETE",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        Keyword::ALL.into_iter().find(|k| k.as_str() == token)
    }
}

impl fmt::Display for Keyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Messages exchanged between the coordinator and an agent
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// One-time capture configuration
    Settings(CaptureSettings),

    /// Capture at the given fleet-clock deadline
    TakePhoto { deadline: Timestamp },

    /// Capture succeeded; newer agents report the capture duration
    PhotoTaken { elapsed: Option<Duration> },

    /// Agent is resource-exhausted and must not be asked to capture again
    RamLow,

    /// The camera reported a hardware error for this round
    CaptureFailed,

    /// Terminate the round loop
    StopRecord,

    /// Acknowledges STOP_RECORD
    RecordingStopped,

    /// Local results are packaged and ready to be pulled
    Ready,

    /// Post-session anomaly report; an empty list is sent as NO_ANOMALIES
    Anomalies { agent: AgentId, rounds: Vec<u32> },

    /// Artifacts were pulled; the agent may release its resources
    ExtractionComplete,
}

impl Message {
    pub fn keyword(&self) -> Keyword {
        match self {
            Message::Settings(_) => Keyword::Settings,
            Message::TakePhoto { .. } => Keyword::TakePhoto,
            Message::PhotoTaken { .. } => Keyword::PhotoTaken,
            Message::RamLow => Keyword::RamLow,
            Message::CaptureFailed => Keyword::CaptureFailed,
            Message::StopRecord => Keyword::StopRecord,
            Message::RecordingStopped => Keyword::RecordingStopped,
            Message::Ready => Keyword::Ready,
            Message::Anomalies { rounds, .. } if rounds.is_empty() => Keyword::NoAnomalies,
            Message::Anomalies { .. } => Keyword::Anomalies,
            Message::ExtractionComplete => Keyword::ExtractionComplete,
        }
    }

    /// Encode message as one terminated frame
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = self.to_string().into_bytes();
        frame.push(FRAME_TERMINATOR);
        frame
    }

    /// Decode one frame body (terminator already stripped)
    pub fn decode(frame: &str) -> SyncResult<Message> {
        let mut tokens = frame.split_ascii_whitespace();
        let head = tokens.next().unwrap_or("");
        let keyword =
            Keyword::from_token(head).ok_or_else(|| SyncError::UnknownKeyword(head.to_string()))?;
        let args: Vec<&str> = tokens.collect();

        let message = match keyword {
            Keyword::Settings => {
                expect_arity(keyword, &args, 3)?;
                Message::Settings(CaptureSettings {
                    width: parse_arg(keyword, args[0])?,
                    height: parse_arg(keyword, args[1])?,
                    exposure_micros: parse_arg(keyword, args[2])?,
                })
            }
            Keyword::TakePhoto => {
                expect_arity(keyword, &args, 1)?;
                Message::TakePhoto {
                    deadline: Timestamp::from_nanos(parse_arg(keyword, args[0])?),
                }
            }
            Keyword::PhotoTaken => match args.as_slice() {
                [] => Message::PhotoTaken { elapsed: None },
                [nanos] => Message::PhotoTaken {
                    elapsed: Some(Duration::from_nanos(parse_arg(keyword, nanos)?)),
                },
                _ => return Err(arity_error(keyword, "at most 1", args.len())),
            },
            Keyword::Anomalies => {
                expect_arity(keyword, &args, 2)?;
                let agent = parse_agent(keyword, args[0])?;
                let rounds = args[1]
                    .split(',')
                    .map(|r| parse_arg(keyword, r))
                    .collect::<SyncResult<Vec<u32>>>()?;
                Message::Anomalies { agent, rounds }
            }
            Keyword::NoAnomalies => {
                expect_arity(keyword, &args, 1)?;
                Message::Anomalies {
                    agent: parse_agent(keyword, args[0])?,
                    rounds: Vec::new(),
                }
            }
            bare => {
                expect_arity(bare, &args, 0)?;
                match bare {
                    Keyword::RamLow => Message::RamLow,
                    Keyword::CaptureFailed => Message::CaptureFailed,
                    Keyword::StopRecord => Message::StopRecord,
                    Keyword::RecordingStopped => Message::RecordingStopped,
                    Keyword::Ready => Message::Ready,
                    _ => Message::ExtractionComplete,
                }
            }
        };

        Ok(message)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keyword = self.keyword();
        match self {
            Message::Settings(s) => {
                write!(f, "{} {} {} {}", keyword, s.width, s.height, s.exposure_micros)
            }
            Message::TakePhoto { deadline } => write!(f, "{} {}", keyword, deadline.as_nanos()),
            Message::PhotoTaken {
                elapsed: Some(elapsed),
            } => write!(f, "{} {}", keyword, duration_as_nanos(*elapsed)),
            Message::Anomalies { agent, rounds } if !rounds.is_empty() => {
                let list: Vec<String> = rounds.iter().map(|r| r.to_string()).collect();
                write!(f, "{} {} {}", keyword, agent, list.join(","))
            }
            Message::Anomalies { agent, .. } => write!(f, "{} {}", keyword, agent),
            _ => f.write_str(keyword.as_str()),
        }
    }
}

fn expect_arity(keyword: Keyword, args: &[&str], expected: usize) -> SyncResult<()> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(arity_error(keyword, &expected.to_string(), args.len()))
    }
}

fn arity_error(keyword: Keyword, expected: &str, actual: usize) -> SyncError {
    SyncError::MalformedFrame {
        keyword: keyword.as_str(),
        detail: format!("expected {} argument(s), got {}", expected, actual),
    }
}

fn parse_arg<T: FromStr>(keyword: Keyword, token: &str) -> SyncResult<T>
where
    T::Err: fmt::Display,
{
    token.parse().map_err(|e: T::Err| SyncError::MalformedFrame {
        keyword: keyword.as_str(),
        detail: format!("{:?}: {}", token, e),
    })
}

fn parse_agent(keyword: Keyword, token: &str) -> SyncResult<AgentId> {
    parse_arg(keyword, token)
}
