//! Digest HTML assembler. Pure: no model calls, no cost.

use std::fmt::Write;

use html_escape::{encode_double_quoted_attribute, encode_text};

use crate::pipeline::types::Digest;

const STYLE: &str = "body{font-family:-apple-system,Segoe UI,Helvetica,Arial,sans-serif;\
max-width:680px;margin:0 auto;padding:24px;color:#1f2328;line-height:1.5}\
h1{font-size:22px;margin-bottom:4px}\
.range{color:#59636e;margin-top:0}\
h2{font-size:17px;border-bottom:1px solid #d1d9e0;padding-bottom:4px;margin-top:28px}\
li{margin-bottom:10px}\
a{color:#0969da}";

/// Render the digest as a standalone HTML document.
///
/// Every piece of digest text is escaped. A section without bullets still
/// gets its heading and an empty list.
pub fn render(digest: &Digest) -> String {
    let title = digest.subject();
    let mut html = String::with_capacity(4096);

    html.push_str("<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n");
    let _ = writeln!(html, "<title>{}</title>", encode_text(&title));
    let _ = writeln!(html, "<style>{STYLE}</style>");
    html.push_str("</head>\n<body>\n");

    html.push_str("<header>\n<h1>Newsletter digest</h1>\n");
    let _ = writeln!(
        html,
        "<p class=\"range\">{}</p>",
        encode_text(&digest.date_range.to_string())
    );
    html.push_str("</header>\n");

    for section in &digest.sections {
        html.push_str("<section>\n");
        let _ = writeln!(html, "<h2>{}</h2>", encode_text(&section.title));
        html.push_str("<ul>\n");
        for bullet in &section.bullets {
            let _ = write!(html, "<li>{}", encode_text(&bullet.text));
            if !bullet.link.trim().is_empty() {
                let _ = write!(
                    html,
                    " <a href=\"{}\">Read more</a>",
                    encode_double_quoted_attribute(&bullet.link)
                );
            }
            html.push_str("</li>\n");
        }
        html.push_str("</ul>\n</section>\n");
    }

    html.push_str("</body>\n</html>\n");
    html
}
