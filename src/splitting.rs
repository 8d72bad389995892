//! Safe markdown split-boundary detection (SPEC_FULL.md §9 Open Question).
//!
//! The split point is the last paragraph break (`"\n\n"`) that does not
//! fall inside an odd-numbered (i.e. still-open) fenced code block. If no
//! such boundary exists the buffer is left unsplit, per spec.md §4.1's
//! "Split-buffer policy".

/// Find the byte offset of the last safe split point in `buffer`, if any.
/// The returned offset always lands just after a `"\n\n"` separator, so
/// the caller can `drain(..offset)` to take the completed prefix.
pub fn find_safe_split_point(buffer: &str) -> Option<usize> {
    // Track whether each "\n\n" candidate sits inside an open code fence
    // by counting ``` occurrences up to that point.
    let mut fence_count = 0usize;
    let mut last_safe: Option<usize> = None;

    let bytes = buffer.as_bytes();
    let mut i = 0usize;
    while i < bytes.len() {
        if buffer[i..].starts_with("```") {
            fence_count += 1;
            i += 3;
            continue;
        }
        if buffer[i..].starts_with("\n\n") {
            if fence_count % 2 == 0 {
                last_safe = Some(i + 2);
            }
            i += 2;
            continue;
        }
        i += 1;
    }

    last_safe
}
