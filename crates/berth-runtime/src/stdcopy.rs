//! Demultiplexer for the engine's attached-stream framing
//!
//! When a container or exec has no TTY, the engine multiplexes stdout and
//! stderr over one connection as frames of
//! `[stream_type, 0, 0, 0, len_be_u32, payload]`. Exec output capture
//! interleaves both streams into one buffer in arrival order.

const HEADER_LEN: usize = 8;

/// Extract the concatenated payloads from a multiplexed stream.
///
/// A trailing truncated frame is dropped rather than erroring: the engine
/// closes the connection mid-frame when the process is killed.
pub fn demux(raw: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(raw.len());
    let mut offset = 0;
    while raw.len() >= offset + HEADER_LEN {
        let len = u32::from_be_bytes([
            raw[offset + 4],
            raw[offset + 5],
            raw[offset + 6],
            raw[offset + 7],
        ]) as usize;
        let start = offset + HEADER_LEN;
        if raw.len() < start + len {
            break;
        }
        output.extend_from_slice(&raw[start..start + len]);
        offset = start + len;
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(stream: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![stream, 0, 0, 0];
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_demux_single_frame() {
        let raw = frame(1, b"hello\n");
        assert_eq!(demux(&raw), b"hello\n");
    }

    #[test]
    fn test_demux_interleaved_streams() {
        let mut raw = frame(1, b"out");
        raw.extend(frame(2, b"err"));
        raw.extend(frame(1, b"more"));
        assert_eq!(demux(&raw), b"outerrmore");
    }

    #[test]
    fn test_demux_truncated_tail() {
        let mut raw = frame(1, b"kept");
        raw.extend([1, 0, 0, 0, 0, 0, 0, 9, b'x']); // frame claims 9 bytes, has 1
        assert_eq!(demux(&raw), b"kept");
    }

    #[test]
    fn test_demux_empty() {
        assert!(demux(&[]).is_empty());
        assert!(demux(&[1, 0, 0]).is_empty());
    }
}
