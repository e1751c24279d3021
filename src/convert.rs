use crate::ports::MarkdownConverter;

/// Converter backed by `html2md`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Html2MdConverter;

impl MarkdownConverter for Html2MdConverter {
    fn convert(&self, html: &str) -> String {
        if html.trim().is_empty() {
            return String::new();
        }
        html2md::parse_html(html)
    }
}
