use crate::error::FileError;

const MAX_NAME_BYTES: usize = 255;

/// Turns a peer-supplied name into a plain file name that cannot leave
/// the destination directory.
///
/// - directory components (`/` or `\`) are dropped, only the last one is kept
/// - `.` and `..` are rejected
/// - control and reserved characters become `_`
/// - leading dots are removed so received files are never hidden
/// - the result is truncated to 255 bytes, keeping the extension
pub fn sanitize_file_name(hint: &str) -> Result<String, FileError> {
    let last = hint
        .rsplit(['/', '\\'])
        .find(|part| !part.trim().is_empty())
        .unwrap_or("")
        .trim();

    if last.is_empty() || last == "." || last == ".." {
        return Err(FileError::InvalidName(hint.to_string()));
    }

    let cleaned: String = last
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        return Err(FileError::InvalidName(hint.to_string()));
    }

    Ok(truncate_keeping_extension(&cleaned, MAX_NAME_BYTES))
}

fn truncate_keeping_extension(name: &str, max: usize) -> String {
    if name.len() <= max {
        return name.to_string();
    }
    let (stem, ext) = match name.rfind('.') {
        Some(i) if name.len() - i <= 16 => (&name[..i], &name[i..]),
        _ => (name, ""),
    };
    let mut budget = max - ext.len();
    while !stem.is_char_boundary(budget) {
        budget -= 1;
    }
    format!("{}{}", &stem[..budget], ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_plain_names() {
        assert_eq!(sanitize_file_name("photo.jpg").unwrap(), "photo.jpg");
        assert_eq!(sanitize_file_name("my file (1).txt").unwrap(), "my file (1).txt");
    }

    #[test]
    fn strips_directories() {
        assert_eq!(sanitize_file_name("../../etc/passwd").unwrap(), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\x\\evil.exe").unwrap(), "evil.exe");
        assert_eq!(sanitize_file_name("dir/").unwrap(), "dir");
    }

    #[test]
    fn rejects_empty_and_dot_names() {
        assert!(sanitize_file_name("").is_err());
        assert!(sanitize_file_name("..").is_err());
        assert!(sanitize_file_name("a/..").is_err());
        assert!(sanitize_file_name("...").is_err());
    }

    #[test]
    fn replaces_reserved_characters() {
        assert_eq!(sanitize_file_name("a:b?c*.txt").unwrap(), "a_b_c_.txt");
        assert_eq!(sanitize_file_name("tab\there").unwrap(), "tab_here");
        assert_eq!(sanitize_file_name(".hidden").unwrap(), "hidden");
    }

    #[test]
    fn long_names_keep_extension() {
        let name = format!("{}.jpg", "é".repeat(200));
        let out = sanitize_file_name(&name).unwrap();
        assert!(out.len() <= MAX_NAME_BYTES);
        assert!(out.ends_with(".jpg"));
    }
}
