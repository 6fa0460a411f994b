use std::path::{Component, Path};

/// 媒体下载只接受 http/https
pub fn is_valid_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// 相对本地路径是否可以安全地拼在下载根目录下
///
/// 拒绝绝对路径和包含 `..` 的路径，防止最终文件逃逸下载根目录。
pub fn is_safe_relative_path(path: &str) -> bool {
    if path.is_empty() {
        return false;
    }

    let path = Path::new(path);
    if path.is_absolute() {
        return false;
    }

    path.components().all(|component| matches!(component, Component::Normal(_)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_validation() {
        assert!(is_valid_url("https://example.com/s1.mp4"));
        assert!(is_valid_url("http://example.com/s1.mp4"));
        assert!(!is_valid_url("ftp://example.com/s1.mp4"));
        assert!(!is_valid_url("invalid-url"));
    }

    #[test]
    fn test_safe_relative_path() {
        assert!(is_safe_relative_path("2024/session.mp4"));
        assert!(is_safe_relative_path("session.mp4"));

        assert!(!is_safe_relative_path(""));
        assert!(!is_safe_relative_path("/etc/passwd"));
        assert!(!is_safe_relative_path("../outside.mp4"));
        assert!(!is_safe_relative_path("2024/../../outside.mp4"));
    }
}
