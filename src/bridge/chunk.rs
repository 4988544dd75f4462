//! Splitting reply text into radio-sized pieces.

/// Largest text payload per outbound packet, before any `[i/n] ` prefix.
pub const MAX_CHUNK_BYTES: usize = 190;

/// Chunk a UTF-8 string into <= max_bytes segments without splitting codepoints.
pub fn chunk_utf8(text: &str, max_bytes: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    if text.len() <= max_bytes {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        if remaining.len() <= max_bytes {
            chunks.push(remaining.to_string());
            break;
        }
        let mut end = max_bytes;
        while end > 0 && !remaining.is_char_boundary(end) {
            end -= 1;
        }
        if end == 0 {
            // A single codepoint wider than max_bytes; emit it whole.
            end = remaining
                .char_indices()
                .nth(1)
                .map_or(remaining.len(), |(i, _)| i);
        }
        chunks.push(remaining[..end].to_string());
        remaining = &remaining[end..];
    }
    chunks
}

/// Radio-ready pieces of `text`. Multi-part output is numbered `[i/n] `.
pub fn chunk_message(text: &str) -> Vec<String> {
    let chunks = chunk_utf8(text, MAX_CHUNK_BYTES);
    let total = chunks.len();
    if total <= 1 {
        return chunks;
    }
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| format!("[{}/{}] {}", i + 1, total, chunk))
        .collect()
}
