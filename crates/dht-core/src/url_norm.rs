//! CDN URL normalization.
//!
//! The same media file is handed out under many URLs that differ only in
//! volatile signing parameters. The archive keys downloads by a canonical
//! form so each file is fetched and stored once.

use url::Url;

/// Query parameters that change which bytes the CDN serves.
///
/// Everything else (signature windows like `ex`/`is`/`hm`, cache busters)
/// is stripped.
const CONTENT_PARAMS: [&str; 5] = ["format", "size", "width", "height", "quality"];

/// Produce the canonical form of a media URL.
///
/// Lowercases the host, preserves path casing, keeps only content-shaping
/// query parameters (in their original order) and drops the fragment.
/// Inputs that do not parse as absolute URLs are returned unchanged so an
/// odd capture still gets archived under *some* stable key.
pub fn normalize_download_url(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw) else {
        return raw.to_owned();
    };

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| CONTENT_PARAMS.contains(&k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if kept.is_empty() {
        url.set_query(None);
    } else {
        let query = kept
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    k.clone()
                } else {
                    format!("{k}={v}")
                }
            })
            .collect::<Vec<_>>()
            .join("&");
        url.set_query(Some(&query));
    }

    url.set_fragment(None);

    // Url::parse already lowercases registered domain hosts.
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_signing_parameters() {
        let raw = "https://cdn.example.com/attachments/1/2/cat.png?ex=66&is=67&hm=abcd";
        assert_eq!(
            normalize_download_url(raw),
            "https://cdn.example.com/attachments/1/2/cat.png"
        );
    }

    #[test]
    fn keeps_content_shaping_parameters() {
        let raw = "https://media.example.com/a/b.webp?size=1024&ex=66&format=png";
        assert_eq!(
            normalize_download_url(raw),
            "https://media.example.com/a/b.webp?size=1024&format=png"
        );
    }

    #[test]
    fn lowercases_host_but_not_path() {
        let raw = "https://CDN.Example.COM/Attachments/Img.PNG";
        assert_eq!(
            normalize_download_url(raw),
            "https://cdn.example.com/Attachments/Img.PNG"
        );
    }

    #[test]
    fn drops_fragment() {
        let raw = "https://cdn.example.com/a.png#section";
        assert_eq!(normalize_download_url(raw), "https://cdn.example.com/a.png");
    }

    #[test]
    fn is_idempotent() {
        let raw = "https://cdn.example.com/a/b.png?ex=1&size=512";
        let once = normalize_download_url(raw);
        assert_eq!(normalize_download_url(&once), once);
    }

    #[test]
    fn unparsable_input_passes_through() {
        assert_eq!(normalize_download_url("not a url"), "not a url");
    }
}
