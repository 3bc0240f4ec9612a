use crate::{
    error::Result,
    example::AnswerPayload,
    fingerprint,
    text_util,
    walker::DiscoveredPage,
};

/// Source of page text and answer payloads.
///
/// The pipeline never reads corpus files itself; swapping the loader lets
/// text come from somewhere other than sidecar files.
pub trait PageLoader: Send + Sync {
    /// Raw, unnormalized page text.
    fn load_text(&self, page: &DiscoveredPage) -> Result<String>;

    fn load_answer(&self, page: &DiscoveredPage) -> Result<AnswerPayload>;
}

/// Reads `Page<N>.txt` and `Page<N>_answer.json` from disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct SidecarLoader;

impl PageLoader for SidecarLoader {
    fn load_text(&self, page: &DiscoveredPage) -> Result<String> {
        Ok(std::fs::read_to_string(&page.source_path)?)
    }

    fn load_answer(&self, page: &DiscoveredPage) -> Result<AnswerPayload> {
        AnswerPayload::from_file(&page.answer_path)
    }
}

/// A page read and normalized, ready to hash and embed.
#[derive(Debug, Clone)]
pub struct LoadedPage {
    pub page: DiscoveredPage,
    pub text: String,
    pub answer: AnswerPayload,
    pub content_hash: String,
}

/// Read, normalize and hash a single page.
pub fn load_page(
    loader: &dyn PageLoader,
    page: &DiscoveredPage,
) -> Result<LoadedPage> {
    let text = text_util::normalize(&loader.load_text(page)?);
    let answer = loader.load_answer(page)?;
    let content_hash = fingerprint::content_hash(&text, &answer);
    Ok(LoadedPage {
        page: page.clone(),
        text,
        answer,
        content_hash,
    })
}
