use crate::models::ProductType;
use chrono::Duration;

/// TTL applied when a duplicate submit hits a deduplicated family.
pub const REFRESH_TTL_MINUTES: i64 = 15;

/// TTL for any record referenced by an unfulfilled order.
pub const ORDER_HOLD_HOURS: i64 = 48;

/// Per-type product shape and retention policy.
#[derive(Debug, Clone, Copy)]
pub struct ProductFamily {
    pub product_type: ProductType,
    pub title_suffix: &'static str,
    pub store_type: &'static str,
    /// Appended to `title-artist` before slugging.
    pub handle_suffix: Option<&'static str>,
    pub price: &'static str,
    pub compare_at_price: &'static str,
    /// Live but unlisted: `published_scope=none` plus private tags.
    pub hidden: bool,
    pub initial_ttl_minutes: i64,
    pub keep_ttl_hours: i64,
    pub deduplicated: bool,
}

impl ProductFamily {
    pub fn title(&self, title: &str) -> String {
        format!("{} {}", title.trim(), self.title_suffix)
    }

    pub fn handle(&self, title: &str, artist: &str) -> String {
        match self.handle_suffix {
            Some(suffix) => slugify(&format!("{title}-{artist}-{suffix}")),
            None => slugify(&format!("{title}-{artist}")),
        }
    }

    pub fn initial_ttl(&self) -> Duration {
        Duration::minutes(self.initial_ttl_minutes)
    }

    pub fn keep_ttl(&self) -> Duration {
        Duration::hours(self.keep_ttl_hours)
    }

    pub fn tags(&self) -> Option<String> {
        self.hidden.then(|| "custom,keychain,private".to_string())
    }

    pub fn published_scope(&self) -> Option<String> {
        self.hidden.then(|| "none".to_string())
    }
}

const FAMILIES: [ProductFamily; 4] = [
    ProductFamily {
        product_type: ProductType::Albumtag,
        title_suffix: "Albumtag",
        store_type: "Music",
        handle_suffix: None,
        price: "14.95",
        compare_at_price: "19.95",
        hidden: false,
        initial_ttl_minutes: 15,
        keep_ttl_hours: 24,
        deduplicated: true,
    },
    ProductFamily {
        product_type: ProductType::Airvinyl,
        title_suffix: "NFC Keychain",
        store_type: "Music",
        handle_suffix: Some("Keychain"),
        price: "14.95",
        compare_at_price: "19.95",
        hidden: false,
        initial_ttl_minutes: 15,
        keep_ttl_hours: 24,
        deduplicated: true,
    },
    ProductFamily {
        product_type: ProductType::Keychain,
        title_suffix: "Custom Keychain",
        store_type: "Custom Keychain",
        handle_suffix: Some("keychain"),
        price: "19.95",
        compare_at_price: "24.95",
        hidden: true,
        initial_ttl_minutes: 12 * 60,
        keep_ttl_hours: 48,
        deduplicated: false,
    },
    ProductFamily {
        product_type: ProductType::CoupleKeychain,
        title_suffix: "Couple Keychain",
        store_type: "Custom Keychain",
        handle_suffix: Some("couple-keychain"),
        price: "24.95",
        compare_at_price: "29.95",
        hidden: true,
        initial_ttl_minutes: 12 * 60,
        keep_ttl_hours: 48,
        deduplicated: false,
    },
];

pub fn family(product_type: ProductType) -> &'static ProductFamily {
    match product_type {
        ProductType::Albumtag => &FAMILIES[0],
        ProductType::Airvinyl => &FAMILIES[1],
        ProductType::Keychain => &FAMILIES[2],
        ProductType::CoupleKeychain => &FAMILIES[3],
    }
}

/// Refill bundle product constants; bundles keep no local record.
pub mod bundle {
    pub const TITLE_SUFFIX: &str = "Refill Bundle";
    pub const VENDOR: &str = "AlbumTagz Bundle";
    pub const STORE_TYPE: &str = "Music Bundle";
    pub const TEMPLATE_SUFFIX: &str = "airvinyl-customize";
    pub const PRICE: &str = "14.95";
    pub const COMPARE_AT_PRICE: &str = "19.95";
}

pub fn album_body_html(artist: &str, catalog_url: &str) -> String {
    format!(
        "<p>Artist: {}</p><p>Spotify URL: {}</p>",
        escape_html(artist),
        escape_html(catalog_url)
    )
}

pub fn keychain_body_html(artist: &str) -> String {
    format!("<p>Personalized keychain for {}.</p>", escape_html(artist))
}

pub fn bundle_body_html(artists: &[String], catalog_urls: &[String]) -> String {
    let mut html = String::from("<p>Bundle includes:</p><ul>");
    for (index, artist) in artists.iter().enumerate() {
        let url = catalog_urls
            .get(index)
            .map(|url| escape_html(url))
            .unwrap_or_else(|| "#".to_string());
        html.push_str(&format!(
            "<li>{} - <a href='{url}' target='_blank'>{url}</a></li>",
            escape_html(artist)
        ));
    }
    html.push_str("</ul>");
    html
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

/// URL-safe handle: lowercase ASCII words joined by single dashes.
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut pending_dash = false;
    for ch in input.chars() {
        if ch == '@' {
            if !slug.is_empty() {
                slug.push('-');
            }
            slug.push_str("at");
            pending_dash = true;
            continue;
        }
        let folded = fold_latin(ch);
        if !folded.chars().all(|c| c.is_ascii_alphanumeric()) {
            pending_dash = true;
            continue;
        }
        if pending_dash && !slug.is_empty() {
            slug.push('-');
        }
        pending_dash = false;
        slug.push_str(&folded.to_ascii_lowercase());
    }
    slug
}

fn fold_latin(ch: char) -> String {
    let folded = match ch {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' => "a",
        'æ' | 'Æ' => "ae",
        'ç' | 'Ç' => "c",
        'è' | 'é' | 'ê' | 'ë' | 'È' | 'É' | 'Ê' | 'Ë' => "e",
        'ì' | 'í' | 'î' | 'ï' | 'Ì' | 'Í' | 'Î' | 'Ï' => "i",
        'ñ' | 'Ñ' => "n",
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' | 'Ø' => "o",
        'ù' | 'ú' | 'û' | 'ü' | 'Ù' | 'Ú' | 'Û' | 'Ü' => "u",
        'ý' | 'ÿ' | 'Ý' => "y",
        'ß' => "ss",
        _ => return ch.to_string(),
    };
    folded.to_string()
}
