//! Acknowledgment protocol.
//!
//! There is no framing: whatever bytes a single non-blocking read returns
//! form one chunk, and every non-empty chunk is answered with the same
//! constant confirmation text. The response never depends on the chunk's
//! content or length.
//!
//! ```text
//! Client:  ping
//! Server:  成功接受到消息！\n
//! ```

use bytes::BytesMut;
use std::borrow::Cow;

/// Confirmation sent for every non-empty chunk ("message received successfully").
pub const ACK_MESSAGE: &str = "成功接受到消息！\n";

/// Append the acknowledgment for `chunk` to `output`.
///
/// Returns the number of bytes appended, which is zero for an empty chunk.
pub fn respond(chunk: &[u8], output: &mut BytesMut) -> usize {
    if chunk.is_empty() {
        return 0;
    }
    output.extend_from_slice(ACK_MESSAGE.as_bytes());
    ACK_MESSAGE.len()
}

/// Render a received chunk for logging.
pub fn describe(chunk: &[u8]) -> Cow<'_, str> {
    String::from_utf8_lossy(chunk)
}
