//! Wire codec: CRLF-framed JSON envelopes carrying data-point maps.
//!
//! Every message on the control channel, in either direction, looks like
//!
//! ```text
//! {"pv":0,"cmd":3,"sn":"1636463662455","msg":{"attr":[1],"data":{"1":0}}}\r\n
//! ```
//!
//! `cmd` selects the [`CommandType`], `sn` is a per-message id chosen by the
//! sender and `msg.data` is the [`DataPointMap`]. Devices add a `"res"` result
//! code to their replies. The codec does no I/O: [`encode`] builds a frame and
//! [`decode`] (or the buffering [`FrameDecoder`]) cuts frames out of whatever
//! bytes the transport has produced so far.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::device::DeviceInfo;
use crate::errors::Error;

type Result<T> = std::result::Result<T, Error>;

/// Line terminator the device firmware's stream reader expects.
pub const TERMINATOR: &[u8] = b"\r\n";

/// Protocol version sent in the `pv` field.
pub const PROTOCOL_VERSION: u8 = 0;

/// Upper bound on buffered bytes without a terminator before the decoder
/// gives up on the segment.
pub const MAX_FRAME_LEN: usize = 16 * 1024;

/// Data point identifier.
pub type Dpid = u16;

/// Command code carried in the `cmd` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandType {
    /// Device information (serial, type, firmware). Code 0.
    Info,
    /// Read data points. Code 2.
    Query,
    /// Write data points. Code 3.
    Set,
    /// Unsolicited state report from the device. Code 10.
    Push,
    /// Any other code a device may send.
    Unknown(u8),
}

impl CommandType {
    pub fn code(&self) -> u8 {
        match self {
            CommandType::Info => 0,
            CommandType::Query => 2,
            CommandType::Set => 3,
            CommandType::Push => 10,
            CommandType::Unknown(code) => *code,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0 => CommandType::Info,
            2 => CommandType::Query,
            3 => CommandType::Set,
            10 => CommandType::Push,
            other => CommandType::Unknown(other),
        }
    }

    /// Whether frames of this type carry device state in `msg.data`.
    pub fn carries_state(&self) -> bool {
        matches!(
            self,
            CommandType::Query | CommandType::Set | CommandType::Push
        )
    }
}

/// Ordered mapping of DPID to value.
///
/// On the wire the keys are decimal strings (`{"1":255,"4":1000}`).
///
/// # Examples
///
/// ```
/// use cozylife_local::DataPointMap;
///
/// let data = DataPointMap::new().with(1, 255).with(4, 1000);
/// assert_eq!(data.get_u32(4), Some(1000));
/// assert_eq!(data.dpids().collect::<Vec<_>>(), vec![1, 4]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataPointMap(BTreeMap<Dpid, Value>);

impl DataPointMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, returning the previous one for that DPID.
    pub fn insert(&mut self, dpid: Dpid, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(dpid, value.into())
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with(mut self, dpid: Dpid, value: impl Into<Value>) -> Self {
        self.insert(dpid, value);
        self
    }

    pub fn get(&self, dpid: Dpid) -> Option<&Value> {
        self.0.get(&dpid)
    }

    /// Read a DPID as an unsigned integer. Booleans read as 0/1.
    pub fn get_u32(&self, dpid: Dpid) -> Option<u32> {
        match self.0.get(&dpid)? {
            Value::Bool(b) => Some(u32::from(*b)),
            Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
            _ => None,
        }
    }

    pub fn get_str(&self, dpid: Dpid) -> Option<&str> {
        self.0.get(&dpid).and_then(Value::as_str)
    }

    pub fn contains(&self, dpid: Dpid) -> bool {
        self.0.contains_key(&dpid)
    }

    pub fn dpids(&self) -> impl Iterator<Item = Dpid> + '_ {
        self.0.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Dpid, &Value)> + '_ {
        self.0.iter().map(|(k, v)| (*k, v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Overwrite entries with those from `other`, keeping DPIDs it does not mention.
    pub fn merge(&mut self, other: &DataPointMap) {
        for (dpid, value) in &other.0 {
            self.0.insert(*dpid, value.clone());
        }
    }

    /// Data point values must be JSON scalars.
    pub fn validate(&self) -> Result<()> {
        for (dpid, value) in &self.0 {
            match value {
                Value::Bool(_) | Value::Number(_) | Value::String(_) => {}
                other => {
                    return Err(Error::Encode(format!(
                        "data point {dpid} has non-scalar value {other}"
                    )));
                }
            }
        }
        Ok(())
    }
}

impl FromIterator<(Dpid, Value)> for DataPointMap {
    fn from_iter<I: IntoIterator<Item = (Dpid, Value)>>(iter: I) -> Self {
        DataPointMap(iter.into_iter().collect())
    }
}

/// A decoded message from a device.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub command: CommandType,
    /// Message id echoed from the request, or chosen by the device for pushes.
    pub sn: String,
    /// DPIDs listed in `msg.attr`.
    pub attrs: Vec<Dpid>,
    pub data: DataPointMap,
    /// Present on INFO replies.
    pub info: Option<DeviceInfo>,
    /// The `res` code, when the device included one.
    pub result: Option<i64>,
}

impl Frame {
    /// Whether this frame reports device state that should be folded into caches.
    pub fn carries_state(&self) -> bool {
        self.command.carries_state() && !self.data.is_empty()
    }
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Serialize, Deserialize)]
struct Envelope<M> {
    #[serde(default)]
    pv: u32,
    cmd: u8,
    #[serde(default)]
    sn: Value,
    msg: M,
    res: Option<i64>,
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Serialize)]
struct OutgoingBody<'a> {
    attr: Option<Vec<Dpid>>,
    data: Option<&'a DataPointMap>,
}

#[derive(Debug, Default, Deserialize)]
struct IncomingBody {
    #[serde(default)]
    attr: Vec<Dpid>,
    #[serde(default)]
    data: DataPointMap,
}

/// Encode a command with a fresh message id.
///
/// A QUERY with an empty map asks for every data point.
///
/// # Examples
///
/// ```
/// use cozylife_local::{CommandType, DataPointMap, codec};
///
/// let frame = codec::encode(CommandType::Set, &DataPointMap::new().with(1, 0)).unwrap();
/// assert!(frame.ends_with(b"\r\n"));
///
/// assert!(codec::encode(CommandType::Set, &DataPointMap::new()).is_err());
/// ```
pub fn encode(command: CommandType, data: &DataPointMap) -> Result<Vec<u8>> {
    encode_with_sn(command, data, &next_sn())
}

/// Encode a command with a caller-chosen message id.
pub fn encode_with_sn(command: CommandType, data: &DataPointMap, sn: &str) -> Result<Vec<u8>> {
    data.validate()?;

    let body = match command {
        CommandType::Info => OutgoingBody {
            attr: None,
            data: None,
        },
        CommandType::Query if data.is_empty() => OutgoingBody {
            attr: Some(vec![0]),
            data: None,
        },
        CommandType::Query => OutgoingBody {
            attr: Some(data.dpids().collect()),
            data: None,
        },
        CommandType::Set if data.is_empty() => {
            return Err(Error::Encode("set command has no data points".to_string()));
        }
        CommandType::Set => OutgoingBody {
            attr: Some(data.dpids().collect()),
            data: Some(data),
        },
        other => {
            return Err(Error::Encode(format!(
                "command {other:?} cannot be sent to a device"
            )));
        }
    };

    let envelope = Envelope {
        pv: u32::from(PROTOCOL_VERSION),
        cmd: command.code(),
        sn: Value::String(sn.to_string()),
        msg: body,
        res: None,
    };

    let mut frame = serde_json::to_vec(&envelope).map_err(|e| Error::Encode(e.to_string()))?;
    frame.extend_from_slice(TERMINATOR);
    Ok(frame)
}

/// Cut the next frame out of `buf`.
///
/// Returns the decode result and the unconsumed remainder:
///
/// - `(Ok(None), rest)` when no terminator is present yet; `rest` is `buf`
///   minus any empty segments that were skipped.
/// - `(Ok(Some(frame)), rest)` for a well-formed segment.
/// - `(Err(Error::Decode(..)), rest)` for a malformed segment, which is
///   consumed so the following frames still decode.
pub fn decode(buf: &[u8]) -> (Result<Option<Frame>>, &[u8]) {
    let mut rest = buf;
    loop {
        let Some(pos) = find_terminator(rest) else {
            return (Ok(None), rest);
        };
        let segment = &rest[..pos];
        let after = &rest[pos + TERMINATOR.len()..];
        if segment.iter().all(u8::is_ascii_whitespace) {
            rest = after;
            continue;
        }
        return (parse_segment(segment).map(Some), after);
    }
}

/// Buffering decoder for a byte stream.
///
/// # Examples
///
/// ```
/// use cozylife_local::{CommandType, codec::FrameDecoder};
///
/// let mut decoder = FrameDecoder::new();
/// decoder.extend(b"{\"cmd\":10,\"sn\":\"1\",\"msg\":{\"attr\":[1],");
/// assert!(decoder.next_frame().is_none());
///
/// decoder.extend(b"\"data\":{\"1\":7}}}\r\n");
/// let frame = decoder.next_frame().unwrap().unwrap();
/// assert_eq!(frame.command, CommandType::Push);
/// assert_eq!(frame.data.get_u32(1), Some(7));
/// ```
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the transport.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Next complete frame, `None` when more bytes are needed.
    pub fn next_frame(&mut self) -> Option<Result<Frame>> {
        let (result, rest) = decode(&self.buffer);
        let consumed = self.buffer.len() - rest.len();
        self.buffer.drain(..consumed);

        match result {
            Ok(None) if self.buffer.len() > MAX_FRAME_LEN => {
                // Keep a frame that started after the junk, if it still fits.
                let len = self.buffer.len();
                let dropped = last_frame_start(&self.buffer)
                    .filter(|&start| start > 0 && len - start <= MAX_FRAME_LEN)
                    .unwrap_or(len);
                self.buffer.drain(..dropped);
                Some(Err(Error::Decode(format!(
                    "{dropped} bytes buffered without a terminator"
                ))))
            }
            other => other.transpose(),
        }
    }

    /// Bytes held back waiting for a terminator.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// Offset of the last `{` that opens a top-level object rather than a nested one.
fn last_frame_start(buf: &[u8]) -> Option<usize> {
    (0..buf.len()).rev().filter(|&i| buf[i] == b'{').find(|&i| {
        let before = buf[..i].iter().rev().find(|b| !b.is_ascii_whitespace());
        !matches!(before, Some(b':' | b',' | b'[' | b'{'))
    })
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(TERMINATOR.len()).position(|w| w == TERMINATOR)
}

fn parse_segment(segment: &[u8]) -> Result<Frame> {
    let envelope: Envelope<Value> =
        serde_json::from_slice(segment).map_err(|e| Error::Decode(e.to_string()))?;
    let command = CommandType::from_code(envelope.cmd);

    let sn = match envelope.sn {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    };

    let mut frame = Frame {
        command,
        sn,
        attrs: Vec::new(),
        data: DataPointMap::new(),
        info: None,
        result: envelope.res,
    };

    match envelope.msg {
        Value::Object(ref map) if command == CommandType::Info && map.contains_key("did") => {
            let info: DeviceInfo =
                serde_json::from_value(envelope.msg).map_err(|e| Error::Decode(e.to_string()))?;
            frame.info = Some(info);
        }
        Value::Object(_) => {
            let body: IncomingBody =
                serde_json::from_value(envelope.msg).map_err(|e| Error::Decode(e.to_string()))?;
            frame.attrs = body.attr;
            frame.data = body.data;
        }
        Value::Null => {}
        other => {
            return Err(Error::Decode(format!("msg is not an object: {other}")));
        }
    }

    Ok(frame)
}

/// Millisecond timestamp, bumped when two messages fall in the same millisecond.
pub fn next_sn() -> String {
    static LAST: AtomicU64 = AtomicU64::new(0);

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();

    let mut prev = LAST.load(Ordering::Relaxed);
    loop {
        let next = now.max(prev + 1);
        match LAST.compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next.to_string(),
            Err(actual) => prev = actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceType;
    use serde_json::json;

    const PUSH: &[u8] = b"{\"cmd\":10,\"pv\":0,\"sn\":\"1636463664000\",\"res\":0,\"msg\":{\"attr\":[1,2,3,4,5,6],\"data\":{\"1\":0,\"2\":0,\"3\":1000,\"4\":1000,\"5\":65535,\"6\":65535}}}\r\n";
    const SET_ACK: &[u8] = b"{\"cmd\":3,\"pv\":0,\"sn\":\"1636463662455\",\"msg\":{\"attr\":[1],\"data\":{\"1\":0}},\"res\":0}\r\n";

    fn decode_all(chunks: &[&[u8]]) -> (Vec<Frame>, Vec<Error>) {
        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        let mut errors = Vec::new();
        for chunk in chunks {
            decoder.extend(chunk);
            while let Some(result) = decoder.next_frame() {
                match result {
                    Ok(frame) => frames.push(frame),
                    Err(e) => errors.push(e),
                }
            }
        }
        (frames, errors)
    }

    #[test]
    fn test_encode_set() {
        let data = DataPointMap::new().with(1, 0);
        let frame = encode_with_sn(CommandType::Set, &data, "1636463662455").unwrap();
        assert_eq!(
            frame,
            b"{\"pv\":0,\"cmd\":3,\"sn\":\"1636463662455\",\"msg\":{\"attr\":[1],\"data\":{\"1\":0}}}\r\n"
        );
    }

    #[test]
    fn test_encode_query_and_info() {
        let empty = DataPointMap::new();
        assert_eq!(
            encode_with_sn(CommandType::Query, &empty, "7").unwrap(),
            b"{\"pv\":0,\"cmd\":2,\"sn\":\"7\",\"msg\":{\"attr\":[0]}}\r\n"
        );
        assert_eq!(
            encode_with_sn(CommandType::Info, &empty, "7").unwrap(),
            b"{\"pv\":0,\"cmd\":0,\"sn\":\"7\",\"msg\":{}}\r\n"
        );

        let subset = DataPointMap::new().with(4, 0).with(3, 0);
        assert_eq!(
            encode_with_sn(CommandType::Query, &subset, "7").unwrap(),
            b"{\"pv\":0,\"cmd\":2,\"sn\":\"7\",\"msg\":{\"attr\":[3,4]}}\r\n"
        );
    }

    #[test]
    fn test_encode_rejects_invalid_input() {
        let nested = DataPointMap::new().with(1, json!({"a": 1}));
        assert!(matches!(
            encode(CommandType::Set, &nested),
            Err(Error::Encode(_))
        ));
        assert!(matches!(
            encode(CommandType::Set, &DataPointMap::new()),
            Err(Error::Encode(_))
        ));
        assert!(matches!(
            encode(CommandType::Push, &DataPointMap::new().with(1, 1)),
            Err(Error::Encode(_))
        ));
    }

    #[test]
    fn test_decode_push() {
        let (result, rest) = decode(PUSH);
        let frame = result.unwrap().unwrap();
        assert!(rest.is_empty());
        assert_eq!(frame.command, CommandType::Push);
        assert_eq!(frame.sn, "1636463664000");
        assert_eq!(frame.attrs, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(frame.data.get_u32(3), Some(1000));
        assert_eq!(frame.result, Some(0));
        assert!(frame.carries_state());
    }

    #[test]
    fn test_decode_info() {
        let raw = b"{\"cmd\":0,\"pv\":0,\"sn\":\"1636463553873\",\"msg\":{\"did\":\"629168597cb94c4c1d8f\",\"dtp\":\"02\",\"pid\":\"e2s64v\",\"mac\":\"7cb94c4c1d8f\",\"ip\":\"192.168.123.57\",\"rssi\":-33,\"sv\":\"1.0.0\",\"hv\":\"0.0.1\"},\"res\":0}\r\n";
        let (result, _) = decode(raw);
        let frame = result.unwrap().unwrap();
        let info = frame.info.as_ref().unwrap();
        assert_eq!(info.serial, "629168597cb94c4c1d8f");
        assert_eq!(info.device_type, Some(DeviceType::EnergyStorage));
        assert_eq!(info.rssi, Some(-33));
        assert!(!frame.carries_state());
    }

    #[test]
    fn test_decode_incomplete_keeps_buffer() {
        let partial = &PUSH[..20];
        let (result, rest) = decode(partial);
        assert!(result.unwrap().is_none());
        assert_eq!(rest, partial);
    }

    #[test]
    fn test_decode_numeric_sn() {
        let (result, _) = decode(b"{\"cmd\":10,\"sn\":42,\"msg\":{\"data\":{\"1\":1}}}\r\n");
        assert_eq!(result.unwrap().unwrap().sn, "42");
    }

    #[test]
    fn test_two_frames_split_at_every_point() {
        let stream: Vec<u8> = [PUSH, SET_ACK].concat();
        for first in 1..stream.len() {
            for second in first..stream.len() {
                let (frames, errors) =
                    decode_all(&[&stream[..first], &stream[first..second], &stream[second..]]);
                assert!(errors.is_empty());
                assert_eq!(frames.len(), 2, "split at {first}/{second}");
                assert_eq!(frames[0].command, CommandType::Push);
                assert_eq!(frames[1].command, CommandType::Set);
                assert_eq!(frames[1].data.get_u32(1), Some(0));
            }
        }
    }

    #[test]
    fn test_malformed_frame_is_isolated() {
        let stream: Vec<u8> = [PUSH, b"{\"cmd\":10,\"msg\":{oops\r\n".as_slice(), SET_ACK].concat();
        let (frames, errors) = decode_all(&[&stream]);
        assert_eq!(frames.len(), 2);
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], Error::Decode(_)));
        assert_eq!(frames[1].sn, "1636463662455");
    }

    #[test]
    fn test_empty_segments_are_skipped() {
        let stream: Vec<u8> = [b"\r\n\r\n".as_slice(), SET_ACK].concat();
        let (frames, errors) = decode_all(&[&stream]);
        assert_eq!(frames.len(), 1);
        assert!(errors.is_empty());
    }

    #[test]
    fn test_oversized_segment_is_dropped() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&vec![b'x'; MAX_FRAME_LEN + 1]);
        assert!(matches!(decoder.next_frame(), Some(Err(Error::Decode(_)))));
        assert_eq!(decoder.buffered(), 0);

        decoder.extend(SET_ACK);
        assert!(decoder.next_frame().unwrap().is_ok());
    }

    #[test]
    fn test_overflow_keeps_frame_that_follows() {
        let mut decoder = FrameDecoder::new();
        let mut bytes = vec![b'x'; MAX_FRAME_LEN];
        bytes.extend_from_slice(&PUSH[..60]);
        decoder.extend(&bytes);

        assert!(matches!(decoder.next_frame(), Some(Err(Error::Decode(_)))));
        assert_eq!(decoder.buffered(), 60);

        decoder.extend(&PUSH[60..]);
        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(frame.command, CommandType::Push);
        assert_eq!(frame.data.get_u32(3), Some(1000));
        assert!(decoder.next_frame().is_none());
    }

    #[test]
    fn test_next_sn_is_monotonic() {
        let a: u64 = next_sn().parse().unwrap();
        let b: u64 = next_sn().parse().unwrap();
        assert!(b > a);
    }
}
