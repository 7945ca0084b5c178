//! multipart/x-mixed-replace framing for MJPEG viewers.

/// Boundary token between parts; existing viewers depend on this exact value.
pub const MJPEG_BOUNDARY: &str = "frame";

pub fn mjpeg_content_type() -> String {
    format!("multipart/x-mixed-replace; boundary={}", MJPEG_BOUNDARY)
}

/// One part: `--frame\r\nContent-Type: image/jpeg\r\n\r\n<jpeg>\r\n`
pub fn multipart_chunk(jpeg: &[u8]) -> Vec<u8> {
    let header = format!("--{}\r\nContent-Type: image/jpeg\r\n\r\n", MJPEG_BOUNDARY);
    let mut chunk = Vec::with_capacity(header.len() + jpeg.len() + 2);
    chunk.extend_from_slice(header.as_bytes());
    chunk.extend_from_slice(jpeg);
    chunk.extend_from_slice(b"\r\n");
    chunk
}
