//! Bare HTML rendering for the browser-facing surfaces.

use actix_web::http::header::ContentType;
use actix_web::http::StatusCode;
use actix_web::HttpResponse;

/// Static page served while the site is in maintenance mode.
pub const MAINTENANCE_HTML: &str = include_str!("../views/503.html");

pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Wrap `body` (already escaped) in a document shell.
pub fn page(title: &str, locale: &str, stylesheet: Option<&str>, body: &str) -> String {
    let link = stylesheet
        .map(|href| format!("<link rel=\"stylesheet\" href=\"{}\">", escape(href)))
        .unwrap_or_default();
    format!(
        "<!doctype html>\n<html lang=\"{}\">\n<head><meta charset=\"utf-8\"><title>{}</title>{link}</head>\n<body>\n{body}\n</body>\n</html>\n",
        escape(locale),
        escape(title),
    )
}

pub fn html(status: StatusCode, document: String) -> HttpResponse {
    HttpResponse::build(status).content_type(ContentType::html()).body(document)
}

pub fn error_list(errors: &[String]) -> String {
    if errors.is_empty() {
        return String::new();
    }
    let items: String = errors.iter().map(|e| format!("<li>{}</li>", escape(e))).collect();
    format!("<ul class=\"errors\">{items}</ul>")
}
