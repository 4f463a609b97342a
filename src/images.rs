use base64::{Engine, engine::general_purpose::STANDARD as BASE64};

const DEFAULT_MIME: &str = "image/jpeg";

/// Turns an inbound image reference into something the model API accepts as an
/// `image_url`: data URIs and http(s) URLs pass through, bare base64 payloads are
/// wrapped in a data URI with a sniffed MIME type.
pub fn to_image_url(reference: &str) -> String {
    let trimmed = reference.trim();
    let lowered = trimmed.get(..8).unwrap_or(trimmed).to_ascii_lowercase();
    if lowered.starts_with("data:") || lowered.starts_with("http://") || lowered.starts_with("https://")
    {
        return trimmed.to_string();
    }
    format!("data:{};base64,{}", sniff_mime(trimmed), trimmed)
}

fn sniff_mime(payload: &str) -> &'static str {
    // 16 base64 chars decode to 12 bytes, enough for every signature below.
    let Some(head) = payload.get(..16) else {
        return DEFAULT_MIME;
    };
    let Ok(bytes) = BASE64.decode(head) else {
        return DEFAULT_MIME;
    };
    match bytes.as_slice() {
        [0x89, b'P', b'N', b'G', ..] => "image/png",
        [0xFF, 0xD8, 0xFF, ..] => "image/jpeg",
        [b'G', b'I', b'F', b'8', ..] => "image/gif",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "image/webp",
        _ => DEFAULT_MIME,
    }
}
