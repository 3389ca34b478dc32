use crate::models::Chunk;

/// Split a document's text into overlapping window-sized chunks.
///
/// Windows and overlap are measured in chars so multi-byte text never gets
/// cut mid-codepoint. Inside each window the cut point prefers a paragraph
/// break, then a sentence end, then any whitespace, and only then falls back
/// to a hard cut at the window edge. Consecutive chunks share `overlap`
/// chars of text. Deterministic: same input, same parameters, same chunks.
///
/// Empty text produces no chunks. Callers must hold `window > overlap`
/// (validated at config load).
pub fn chunk_text(document_id: &str, text: &str, window: usize, overlap: usize) -> Vec<Chunk> {
    debug_assert!(window > overlap, "window must exceed overlap");
    if text.is_empty() || window == 0 {
        return Vec::new();
    }

    // Byte offset of every char boundary, plus the end of the text. Cut
    // points are char indices into this table.
    let boundaries: Vec<usize> = text
        .char_indices()
        .map(|(b, _)| b)
        .chain(std::iter::once(text.len()))
        .collect();
    let total = boundaries.len() - 1;

    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut position = 0usize;
    loop {
        let hard_end = (start + window).min(total);
        let end = if hard_end < total {
            find_cut(text, &boundaries, start, hard_end, overlap)
        } else {
            hard_end
        };
        chunks.push(Chunk {
            id: format!("{document_id}#{position}"),
            document_id: document_id.to_string(),
            position_index: position,
            char_span: (start, end),
            text: text[boundaries[start]..boundaries[end]].to_string(),
        });
        if end >= total {
            break;
        }
        start = end - overlap;
        position += 1;
    }
    chunks
}

/// Pick the cut point for a window starting at char `start` and capped at
/// char `hard_end`. The cut must land past `start + overlap` or the next
/// chunk would not advance.
fn find_cut(text: &str, boundaries: &[usize], start: usize, hard_end: usize, overlap: usize) -> usize {
    let min_end = start + overlap + 1;
    if hard_end <= min_end {
        return hard_end;
    }
    let lo = boundaries[start];
    let hi = boundaries[hard_end];
    let window = &text[lo..hi];

    // A higher-preference separator that sits inside the overlap region is
    // useless; fall through to the next kind instead of hard-cutting.
    let candidates = [
        window.rfind("\n\n").map(|p| p + 2),
        rfind_sentence_end(window),
        window.rfind([' ', '\n']).map(|p| p + 1),
    ];
    for rel in candidates.into_iter().flatten() {
        // The separators searched for are ASCII, so `lo + rel` is a char
        // boundary and present in the table.
        let end = char_index_at(boundaries, lo + rel);
        if end > min_end {
            return end;
        }
    }
    hard_end
}

/// Byte offset of the char right after a `.`, `!` or `?` that is followed by
/// a space or newline, searching from the end of the window.
fn rfind_sentence_end(window: &str) -> Option<usize> {
    let bytes = window.as_bytes();
    (1..bytes.len())
        .rev()
        .find(|&i| {
            matches!(bytes[i - 1], b'.' | b'!' | b'?') && matches!(bytes[i], b' ' | b'\n')
        })
        .map(|i| i + 1)
}

fn char_index_at(boundaries: &[usize], byte: usize) -> usize {
    boundaries
        .binary_search(&byte)
        .expect("cut point must be a char boundary")
}
