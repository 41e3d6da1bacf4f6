//! Wire envelope and framing.
//!
//! Every record is one JSON-encoded `Message` terminated by a newline:
//!
//! ```text
//! {"type":1,"id":7,"method":"Math.Div","args":[10,2],"result":[],"error":""}\n
//! {"type":2,"id":7,"method":"","args":[],"result":[5],"error":""}\n
//! ```
//!
//! JSON escapes newlines inside strings, so an encoded record never contains
//! the separator. Records larger than the configured maximum break framing
//! and are fatal to the connection.

use crate::{IpcError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt};

/// Record separator.
pub const FRAME_SEPARATOR: u8 = b'\n';

/// Kind of a wire message, encoded as an integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MessageKind {
    Call,
    Response,
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Call => 1,
            MessageKind::Response => 2,
        }
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageKind::Call),
            2 => Ok(MessageKind::Response),
            other => Err(format!("unknown message type {}", other)),
        }
    }
}

/// One wire record: a call or a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub id: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub method: String,
    #[serde(default, alias = "params", deserialize_with = "null_as_default")]
    pub args: Vec<serde_json::Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub result: Vec<serde_json::Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub error: String,
}

/// Peers encode empty slices and strings as `null`.
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl Message {
    /// Create a call message.
    pub fn call(id: i64, method: impl Into<String>, args: Vec<serde_json::Value>) -> Self {
        Self {
            kind: MessageKind::Call,
            id,
            method: method.into(),
            args,
            result: Vec::new(),
            error: String::new(),
        }
    }

    /// Create a success response.
    pub fn success(id: i64, result: Vec<serde_json::Value>) -> Self {
        Self {
            kind: MessageKind::Response,
            id,
            method: String::new(),
            args: Vec::new(),
            result,
            error: String::new(),
        }
    }

    /// Create an error response.
    pub fn failure(id: i64, error: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Response,
            id,
            method: String::new(),
            args: Vec::new(),
            result: Vec::new(),
            error: error.into(),
        }
    }

    /// Check that only the fields of this message's kind are populated.
    pub fn validate(&self) -> Result<()> {
        match self.kind {
            MessageKind::Call => {
                if self.method.is_empty() {
                    return Err(IpcError::malformed(format!(
                        "call id={} has no method",
                        self.id
                    )));
                }
                if !self.result.is_empty() || !self.error.is_empty() {
                    return Err(IpcError::malformed(format!(
                        "call id={} carries response fields",
                        self.id
                    )));
                }
            }
            MessageKind::Response => {
                if !self.args.is_empty() {
                    return Err(IpcError::malformed(format!(
                        "response id={} carries call arguments",
                        self.id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Encode as one newline-terminated record.
    pub fn encode(&self, max_frame_size: usize) -> Result<Vec<u8>> {
        let mut data = serde_json::to_vec(self)?;
        if data.len() > max_frame_size {
            return Err(IpcError::FrameTooLarge {
                size: data.len(),
                max: max_frame_size,
            });
        }
        data.push(FRAME_SEPARATOR);
        Ok(data)
    }

    /// Decode one record, without its separator.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let msg: Message = serde_json::from_slice(frame)
            .map_err(|e| IpcError::malformed(format!("unmarshal message: {}", e)))?;
        msg.validate()?;
        Ok(msg)
    }
}

/// Read one newline-delimited record from an async reader.
///
/// Returns `None` on clean EOF. A final record without a trailing newline is
/// still returned. The separator is stripped.
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut frame = Vec::new();
    // One extra byte for the separator, one more to detect overflow.
    let limit = (max_frame_size as u64).saturating_add(2);
    let read = (&mut *reader)
        .take(limit)
        .read_until(FRAME_SEPARATOR, &mut frame)
        .await?;

    if read == 0 {
        return Ok(None);
    }

    if frame.last() == Some(&FRAME_SEPARATOR) {
        frame.pop();
    }

    if frame.len() > max_frame_size {
        return Err(IpcError::FrameTooLarge {
            size: frame.len(),
            max: max_frame_size,
        });
    }

    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IpcDefaults;
    use crate::value::Value;
    use proptest::prelude::*;
    use serde_json::json;
    use tokio::io::BufReader;

    fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            any::<i64>().prop_map(Value::Int),
            ".*".prop_map(Value::Str),
            any::<bool>().prop_map(Value::Bool),
            proptest::collection::vec(any::<u8>(), 0..32).prop_map(Value::Blob),
        ];
        leaf.prop_recursive(3, 16, 4, |inner| {
            proptest::collection::vec(inner, 0..4).prop_map(Value::Array)
        })
    }

    fn wire_values() -> impl Strategy<Value = Vec<serde_json::Value>> {
        proptest::collection::vec(arb_value(), 0..4)
            .prop_map(|values| values.iter().map(Value::to_wire).collect())
    }

    fn arb_message() -> impl Strategy<Value = Message> {
        prop_oneof![
            (any::<i64>(), "(.|\n)+", wire_values())
                .prop_map(|(id, method, args)| Message::call(id, method, args)),
            (any::<i64>(), wire_values()).prop_map(|(id, result)| Message::success(id, result)),
            (any::<i64>(), "(.|\n)+").prop_map(|(id, error)| Message::failure(id, error)),
        ]
    }

    proptest! {
        #[test]
        fn prop_frames_decode_to_the_encoded_message(msg in arb_message()) {
            let frame = msg.encode(IpcDefaults::MAX_FRAME_SIZE).unwrap();
            prop_assert_eq!(frame.iter().filter(|b| **b == FRAME_SEPARATOR).count(), 1);
            prop_assert_eq!(frame.last(), Some(&FRAME_SEPARATOR));

            let decoded = Message::decode(&frame[..frame.len() - 1]).unwrap();
            prop_assert_eq!(decoded, msg);
        }

        #[test]
        fn prop_frames_survive_the_reader(msgs in proptest::collection::vec(arb_message(), 1..6)) {
            let mut stream = Vec::new();
            for msg in &msgs {
                stream.extend(msg.encode(IpcDefaults::MAX_FRAME_SIZE).unwrap());
            }
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let decoded = runtime.block_on(async {
                let mut reader = BufReader::new(stream.as_slice());
                let mut out = Vec::new();
                while let Some(frame) = read_frame(&mut reader, IpcDefaults::MAX_FRAME_SIZE).await.unwrap() {
                    out.push(Message::decode(&frame).unwrap());
                }
                out
            });
            prop_assert_eq!(decoded, msgs);
        }
    }

    #[test]
    fn test_call_wire_shape() {
        let msg = Message::call(3, "Math.Div", vec![json!(10), json!(2)]);
        let frame = msg.encode(1024).unwrap();
        assert_eq!(frame.last(), Some(&b'\n'));

        let parsed: serde_json::Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(parsed["type"], json!(1));
        assert_eq!(parsed["id"], json!(3));
        assert_eq!(parsed["method"], json!("Math.Div"));
        assert_eq!(parsed["args"], json!([10, 2]));
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let msg = Message::failure(9, "line one\nline two");
        let frame = msg.encode(1024).unwrap();
        // Embedded newlines are escaped, so the only separator is the last byte.
        assert_eq!(frame.iter().filter(|b| **b == b'\n').count(), 1);
        let decoded = Message::decode(&frame[..frame.len() - 1]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_decode_accepts_nulls_and_params_alias() {
        let msg = Message::decode(
            br#"{"type":2,"id":1,"method":"","args":null,"result":[5],"error":""}"#,
        )
        .unwrap();
        assert_eq!(msg.kind, MessageKind::Response);
        assert!(msg.args.is_empty());

        let msg = Message::decode(br#"{"type":1,"id":4,"method":"A.b","params":[true]}"#).unwrap();
        assert_eq!(msg.args, vec![json!(true)]);
        assert!(msg.error.is_empty());
    }

    #[test]
    fn test_decode_rejects_schema_violations() {
        for frame in [
            &b"not json"[..],
            br#"{"type":3,"id":1}"#,
            br#"{"type":1,"id":1}"#,
            br#"{"type":1,"id":1,"method":"A.b","error":"x"}"#,
            br#"{"type":2,"id":1,"args":[1]}"#,
            br#"{"id":1,"method":"A.b"}"#,
        ] {
            let err = Message::decode(frame).unwrap_err();
            assert!(
                matches!(err, IpcError::MalformedFrame { .. }),
                "unexpected error for {:?}: {:?}",
                String::from_utf8_lossy(frame),
                err
            );
        }
    }

    #[test]
    fn test_encode_rejects_oversized() {
        let msg = Message::success(1, vec![json!("x".repeat(100))]);
        let err = msg.encode(50).unwrap_err();
        assert!(matches!(err, IpcError::FrameTooLarge { max: 50, .. }));
    }

    #[tokio::test]
    async fn test_read_frames_in_sequence() {
        let data: &[u8] = b"{\"a\":1}\n{\"b\":2}\n{\"c\":3}";
        let mut reader = BufReader::new(data);

        assert_eq!(read_frame(&mut reader, 64).await.unwrap().unwrap(), b"{\"a\":1}");
        assert_eq!(read_frame(&mut reader, 64).await.unwrap().unwrap(), b"{\"b\":2}");
        // Last record without a separator
        assert_eq!(read_frame(&mut reader, 64).await.unwrap().unwrap(), b"{\"c\":3}");
        assert!(read_frame(&mut reader, 64).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_frame_at_limit() {
        let data: &[u8] = b"12345\n123456\n";
        let mut reader = BufReader::new(data);

        assert_eq!(read_frame(&mut reader, 5).await.unwrap().unwrap(), b"12345");
        let err = read_frame(&mut reader, 5).await.unwrap_err();
        assert!(matches!(err, IpcError::FrameTooLarge { max: 5, .. }));
    }
}
