use std::path::Path;

/// Last `n` lines of `path`, oldest first. Unreadable files yield nothing.
pub fn tail_lines(path: &Path, n: usize) -> Vec<String> {
    let file = match xx::file::open(path) {
        Ok(f) => f,
        Err(e) => {
            trace!("{}: {e}", path.display());
            return vec![];
        }
    };
    let mut lines: Vec<String> = rev_lines::RevLines::new(file)
        .filter_map(Result::ok)
        .take(n)
        .collect();
    lines.reverse();
    lines
}

/// Tail formatted for error messages.
pub fn excerpt(path: &Path, n: usize) -> String {
    let lines = tail_lines(path, n);
    if lines.is_empty() {
        return format!("(no output in {})", path.display());
    }
    format!("--- last {} lines of {} ---\n{}", lines.len(), path.display(), lines.join("\n"))
}
