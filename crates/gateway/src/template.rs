//! The HTML templating collaborator used by the `get-sheet-response`
//! special handler (§1 Out of scope, §4.6). Out of scope says HTML
//! templating of remote content is an external concern; this module
//! only fixes the interface the Response Router calls into.

/// Wraps a peer-rendered sheet fragment (`html`/`css`) into a full HTML
/// document for callers that did not ask for raw JSON.
pub trait SheetTemplate: Send + Sync {
    /// Produce a complete HTML document embedding `html` and `css`.
    fn render(&self, html: &str, css: &str) -> String;
}

/// A minimal, dependency-free default: a single `<style>` block followed
/// by the sheet markup. Real deployments are expected to supply their
/// own implementation (brand chrome, asset links, and the like).
pub struct StaticSheetTemplate;

impl SheetTemplate for StaticSheetTemplate {
    fn render(&self, html: &str, css: &str) -> String {
        format!(
            "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><style>{css}</style></head><body>{html}</body></html>"
        )
    }
}
