use url::Url;

/// 一个候选下载变体：远端地址 + 相对本地路径
///
/// 由内容方按偏好顺序给出，编排器选第一个两者都可解析的变体。
#[derive(Debug, Clone)]
pub struct MediaVariant {
    pub remote_url: Option<Url>,
    pub relative_local_path: Option<String>,
}

impl MediaVariant {
    pub fn new(remote_url: Option<Url>, relative_local_path: Option<String>) -> Self {
        Self { remote_url, relative_local_path }
    }

    /// 远端地址和本地路径都可解析时返回两者
    pub fn resolved(&self) -> Option<(Url, String)> {
        match (&self.remote_url, &self.relative_local_path) {
            (Some(url), Some(path)) => Some((url.clone(), path.clone())),
            _ => None,
        }
    }
}

/// 可下载内容契约：由领域对象实现，向编排器暴露稳定 ID、
/// 展示标题和按偏好排序的变体列表
pub trait DownloadableContent {
    /// 全局稳定且唯一的内容 ID，通常由内容本身派生
    fn id(&self) -> &str;

    /// 展示给用户的标题
    fn title(&self) -> &str;

    /// 按最优先到最不优先排序的下载变体
    fn media_variants(&self) -> Vec<MediaVariant>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_resolution() {
        let full = MediaVariant::new(
            Some(Url::parse("https://example.com/a.mp4").unwrap()),
            Some("2024/a.mp4".to_string()),
        );
        assert!(full.resolved().is_some());

        let no_url = MediaVariant::new(None, Some("2024/a.mp4".to_string()));
        assert!(no_url.resolved().is_none());

        let no_path = MediaVariant::new(Some(Url::parse("https://example.com/a.mp4").unwrap()), None);
        assert!(no_path.resolved().is_none());
    }
}
