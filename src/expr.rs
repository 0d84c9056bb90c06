//! Callback argument expressions and musical time notation
//!
//! Scheduled callbacks are declared remotely as data; any argument flagged
//! `eval` carries a small expression re-evaluated at fire time. The grammar
//! is closed on purpose (no general evaluation):
//!
//! - `time`               — the fire-time clock value
//! - `time + 0.5`         — clock value plus a literal offset (seconds)
//! - `time + 8n`          — clock value plus a musical duration
//! - `value` / `value.x`  — the event value (or one of its fields)
//! - `0.25`               — a bare numeric literal
//!
//! Musical durations follow the usual notation: `4n` quarter note, `8t`
//! eighth triplet, `4n.` dotted quarter, `2m` two measures, `0:2:0`
//! bars:beats:sixteenths. All of them resolve against the transport tempo
//! and time signature at evaluation time.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::{char, multispace0},
    combinator::{all_consuming, map, opt},
    number::complete::double,
    sequence::{preceded, tuple},
    IResult,
};
use serde_json::Value;

use crate::error::{Result, SyncError};
use crate::protocol::TimeValue;

/// Pulses per quarter note used for tick read-backs.
pub const PPQ: f64 = 192.0;

/// A parsed musical duration or position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MusicTime {
    Seconds(f64),
    /// Subdivision of a whole note: `4n`, `8t`, `2n.`
    Note { denominator: u32, kind: NoteKind },
    /// Whole measures: `1m`, `2.5m`
    Measures(f64),
    /// Transport position: bars:beats:sixteenths
    Position { bars: u32, beats: u32, sixteenths: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteKind {
    Straight,
    Triplet,
    Dotted,
}

impl MusicTime {
    /// Resolve to seconds at the given tempo and beats-per-measure.
    pub fn to_seconds(&self, bpm: f64, beats_per_measure: u32) -> f64 {
        let beat = 60.0 / bpm;
        match *self {
            MusicTime::Seconds(s) => s,
            MusicTime::Note { denominator, kind } => {
                let beats = 4.0 / denominator as f64;
                let scaled = match kind {
                    NoteKind::Straight => beats,
                    NoteKind::Triplet => beats * 2.0 / 3.0,
                    NoteKind::Dotted => beats * 1.5,
                };
                scaled * beat
            }
            MusicTime::Measures(m) => m * beats_per_measure as f64 * beat,
            MusicTime::Position {
                bars,
                beats,
                sixteenths,
            } => {
                let total_beats =
                    bars as f64 * beats_per_measure as f64 + beats as f64 + sixteenths / 4.0;
                total_beats * beat
            }
        }
    }
}

fn uint(input: &str) -> IResult<&str, u32> {
    map(take_while1(|c: char| c.is_ascii_digit()), |s: &str| {
        s.parse::<u32>().unwrap_or(0)
    })(input)
}

fn note_duration(input: &str) -> IResult<&str, MusicTime> {
    map(
        tuple((
            uint,
            alt((char('n'), char('t'))),
            opt(char('.')),
        )),
        |(denominator, suffix, dot)| {
            let kind = if suffix == 't' {
                NoteKind::Triplet
            } else if dot.is_some() {
                NoteKind::Dotted
            } else {
                NoteKind::Straight
            };
            MusicTime::Note { denominator, kind }
        },
    )(input)
}

fn measures(input: &str) -> IResult<&str, MusicTime> {
    map(tuple((double, char('m'))), |(m, _)| MusicTime::Measures(m))(input)
}

fn position(input: &str) -> IResult<&str, MusicTime> {
    map(
        tuple((uint, char(':'), uint, char(':'), double)),
        |(bars, _, beats, _, sixteenths)| MusicTime::Position {
            bars,
            beats,
            sixteenths,
        },
    )(input)
}

fn seconds(input: &str) -> IResult<&str, MusicTime> {
    map(double, MusicTime::Seconds)(input)
}

fn music_time(input: &str) -> IResult<&str, MusicTime> {
    // Order matters: "0:2:0" and "4n" both start with digits.
    alt((position, note_duration, measures, seconds))(input)
}

/// Parse a musical time string such as `"4n"`, `"1m"`, `"0:2:0"` or `"1.5"`.
pub fn parse_music_time(input: &str) -> Result<MusicTime> {
    all_consuming(music_time)(input.trim())
        .map(|(_, t)| t)
        .map_err(|_| SyncError::InvalidTime(input.to_string()))
}

/// Resolve a wire-level time value to seconds at the current tempo.
pub fn resolve_time(value: &TimeValue, bpm: f64, beats_per_measure: u32) -> Result<f64> {
    match value {
        TimeValue::Seconds(s) => Ok(*s),
        TimeValue::Notation(s) => {
            Ok(parse_music_time(s)?.to_seconds(bpm, beats_per_measure))
        }
    }
}

/// A compiled callback argument expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Bare numeric literal.
    Literal(f64),
    /// The fire-time clock value.
    Time,
    /// Clock value plus a fixed musical offset.
    TimeOffset(MusicTime),
    /// The whole event value.
    ValueRef,
    /// One field of the event value.
    ValueField(String),
}

fn ident(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_')(input)
}

fn time_expr(input: &str) -> IResult<&str, Expr> {
    map(
        tuple((
            tag("time"),
            opt(preceded(
                tuple((multispace0, char('+'), multispace0)),
                music_time,
            )),
        )),
        |(_, offset)| match offset {
            Some(t) => Expr::TimeOffset(t),
            None => Expr::Time,
        },
    )(input)
}

fn value_expr(input: &str) -> IResult<&str, Expr> {
    map(
        preceded(tag("value"), opt(preceded(char('.'), ident))),
        |field| match field {
            Some(name) => Expr::ValueField(name.to_string()),
            None => Expr::ValueRef,
        },
    )(input)
}

fn literal_expr(input: &str) -> IResult<&str, Expr> {
    map(double, Expr::Literal)(input)
}

/// Parse one callback argument expression.
pub fn parse_expr(input: &str) -> Result<Expr> {
    all_consuming(alt((time_expr, value_expr, literal_expr)))(input.trim())
        .map(|(_, e)| e)
        .map_err(|_| SyncError::InvalidExpr(input.to_string()))
}

/// Everything an expression may reference at fire time.
#[derive(Debug, Clone, Copy)]
pub struct EvalCtx<'a> {
    /// Fire-time clock value (transport seconds).
    pub time: f64,
    /// Event value for part/sequence/pattern callbacks.
    pub value: Option<&'a Value>,
    pub bpm: f64,
    pub beats_per_measure: u32,
}

impl Expr {
    /// Evaluate against the invocation-time clock and event value.
    pub fn eval(&self, ctx: &EvalCtx<'_>) -> Value {
        match self {
            Expr::Literal(v) => json_number(*v),
            Expr::Time => json_number(ctx.time),
            Expr::TimeOffset(offset) => {
                json_number(ctx.time + offset.to_seconds(ctx.bpm, ctx.beats_per_measure))
            }
            Expr::ValueRef => ctx.value.cloned().unwrap_or(Value::Null),
            Expr::ValueField(field) => ctx
                .value
                .and_then(|v| v.get(field))
                .cloned()
                .unwrap_or(Value::Null),
        }
    }
}

fn json_number(v: f64) -> Value {
    serde_json::Number::from_f64(v)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}
