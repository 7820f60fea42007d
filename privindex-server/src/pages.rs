//! PEP 503 "simple repository" pages.

use crate::index::{PackageIndex, PkgRef};
use std::fmt::Write;

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            other => out.push(other),
        }
    }
    out
}

fn page(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n  <head>\n    <meta name=\"pypi:repository-version\" content=\"1.0\">\n    <title>{title}</title>\n  </head>\n  <body>\n    <h1>{title}</h1>\n{body}  </body>\n</html>\n",
        title = escape_html(title),
    )
}

/// The root page: one link per distribution, in index order.
pub fn render_simple_index(index: &PackageIndex) -> String {
    let mut body = String::new();
    for distrib in index.all_distributions() {
        let distrib = escape_html(distrib);
        // Writing into a String cannot fail.
        let _ = writeln!(body, "    <a href=\"{distrib}/\">{distrib}</a><br>");
    }
    page("Links for all distributions", &body)
}

/// The files of one distribution, each linked with its sha256 fragment.
pub fn render_distribution_page(distrib: &str, pkg_refs: &[PkgRef]) -> String {
    let mut body = String::new();
    for pkg_ref in pkg_refs {
        let filename = escape_html(&pkg_ref.filename());
        let sha256 = escape_html(&pkg_ref.sha256);
        let _ = writeln!(
            body,
            "    <a href=\"{filename}#sha256={sha256}\">{filename}</a><br>"
        );
    }
    page(&format!("Links for {distrib}"), &body)
}
