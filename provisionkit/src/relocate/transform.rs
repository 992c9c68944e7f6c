//! Byte-level marker substitution.

/// Replace every occurrence of any marker in `content` with `replacement`.
///
/// Markers are matched left to right, longest first when several start at
/// the same offset. Returns `None` when no marker occurs, so running the
/// transform again on its own output is a no-op unless the replacement
/// itself contains a marker. Empty markers and markers equal to the
/// replacement are ignored.
pub fn substitute(content: &[u8], markers: &[&[u8]], replacement: &[u8]) -> Option<Vec<u8>> {
    let mut active: Vec<&[u8]> = markers
        .iter()
        .copied()
        .filter(|m| !m.is_empty() && *m != replacement)
        .collect();
    if active.is_empty() {
        return None;
    }
    active.sort_by(|a, b| b.len().cmp(&a.len()));

    let mut output: Option<Vec<u8>> = None;
    let mut copied_up_to = 0;
    let mut pos = 0;

    while pos < content.len() {
        let hit = active.iter().find(|m| content[pos..].starts_with(m));
        match hit {
            Some(marker) => {
                let out = output.get_or_insert_with(|| Vec::with_capacity(content.len()));
                out.extend_from_slice(&content[copied_up_to..pos]);
                out.extend_from_slice(replacement);
                pos += marker.len();
                copied_up_to = pos;
            }
            None => pos += 1,
        }
    }

    output.map(|mut out| {
        out.extend_from_slice(&content[copied_up_to..]);
        out
    })
}

/// Whether `content` contains `marker`.
pub fn contains_marker(content: &[u8], marker: &[u8]) -> bool {
    !marker.is_empty() && content.windows(marker.len()).any(|w| w == marker)
}
