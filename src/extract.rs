use scraper::{Html, Selector};
use tracing::{debug, warn};
use url::Url;

/// One listing found on a target page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub title: String,
    pub url: String,
    /// Dedup key: the resolved absolute URL, compared as an exact string.
    pub id: String,
}

impl Item {
    fn from_link(title: String, url: Url) -> Self {
        let url = String::from(url);
        Self {
            title,
            id: url.clone(),
            url,
        }
    }
}

/// Apply `selector` to `html` and return the linked candidates in document order.
///
/// Never fails: empty input, malformed markup, an unparseable selector or a
/// selector that matches nothing all yield an empty list. Candidates without an
/// `href`, or whose `href` does not resolve against `base_url`, are skipped.
pub fn extract(html: &str, selector: &str, base_url: &Url) -> Vec<Item> {
    if html.trim().is_empty() {
        return Vec::new();
    }

    let selector = match Selector::parse(selector) {
        Ok(s) => s,
        Err(e) => {
            warn!(selector, "Invalid selector: {}", e);
            return Vec::new();
        }
    };

    let document = Html::parse_document(html);
    let mut items = Vec::new();

    for element in document.select(&selector) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };

        let url = match base_url.join(href) {
            Ok(u) => u,
            Err(e) => {
                debug!(href, "Skipping unresolvable link: {}", e);
                continue;
            }
        };

        let title = normalize_whitespace(&element.text().collect::<String>());
        items.push(Item::from_link(title, url));
    }

    items
}

fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
