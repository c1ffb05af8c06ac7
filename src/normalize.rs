use url::Url;

/// normalize a relay URL: coerce http(s) schemes to ws(s), default bare
/// hosts to wss (ws for localhost), lowercase the host, trim the trailing
/// slash from the path
pub fn normalize_url(url_str: &str) -> Result<Url, url::ParseError> {
    let url_str = match url_str.split_once("://") {
        Some((scheme, _)) if scheme.eq_ignore_ascii_case("ws") || scheme.eq_ignore_ascii_case("wss") => {
            url_str.to_string()
        }
        Some((scheme, _))
            if scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https") =>
        {
            format!("ws{}", &url_str[4..])
        }
        _ => {
            if url_str.starts_with("localhost")
                || url_str.contains(".localhost")
                || url_str.starts_with("127.0.0.1")
            {
                format!("ws://{}", url_str)
            } else {
                format!("wss://{}", url_str)
            }
        }
    };
    let mut url = Url::parse(&url_str)?;

    if let Some(host) = url.host_str() {
        let _ = url.set_host(Some(&host.to_lowercase()));
    }

    let path = url.path().trim_end_matches('/').to_owned();
    url.set_path(&path);

    Ok(url)
}
