//! Credentials a session authenticates with.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use reqwest::Url;
use reqwest::cookie::Jar;
use tracing::debug;

use crate::error::LiveError;

/// How a session obtains its authenticated channel.
///
/// Moved into the session it opens; a session never shares its context.
pub enum AuthContext {
    /// Interactive login with mail address and password
    Credentials { mail: String, password: String },
    /// Reuse of cookies exported from a logged-in browser
    Cookies(Arc<Jar>),
}

impl AuthContext {
    pub fn credentials(mail: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Credentials {
            mail: mail.into(),
            password: password.into(),
        }
    }

    /// Load a Netscape-format `cookies.txt` export.
    pub async fn from_cookie_file(path: &Path) -> Result<Self, LiveError> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            LiveError::Cookies(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_cookie_str(&contents)
    }

    pub fn from_cookie_str(contents: &str) -> Result<Self, LiveError> {
        let now = chrono::Utc::now().timestamp();
        let jar = Jar::default();
        let mut loaded = 0usize;

        for line in contents.lines() {
            let Some(cookie) = CookieLine::parse(line) else {
                continue;
            };
            if cookie.expires != 0 && cookie.expires < now {
                debug!("Skipping expired cookie {} for {}", cookie.name, cookie.domain);
                continue;
            }
            let url = cookie.url()?;
            jar.add_cookie_str(&cookie.set_cookie_header(), &url);
            loaded += 1;
        }

        if loaded == 0 {
            return Err(LiveError::Cookies("no usable cookies found".to_string()));
        }
        debug!("Loaded {} cookies", loaded);
        Ok(Self::Cookies(Arc::new(jar)))
    }

    /// Whether opening a session with this context performs a login of its own.
    pub fn logs_in(&self) -> bool {
        matches!(self, Self::Credentials { .. })
    }
}

impl fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Credentials { mail, .. } => f
                .debug_struct("Credentials")
                .field("mail", mail)
                .field("password", &"<redacted>")
                .finish(),
            Self::Cookies(_) => f.write_str("Cookies(..)"),
        }
    }
}

/// One record of a Netscape cookie file.
#[derive(Debug, PartialEq, Eq)]
struct CookieLine<'a> {
    domain: &'a str,
    include_subdomains: bool,
    path: &'a str,
    secure: bool,
    expires: i64,
    name: &'a str,
    value: &'a str,
}

impl<'a> CookieLine<'a> {
    fn parse(line: &'a str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let line = match line.strip_prefix("#HttpOnly_") {
            Some(rest) => rest,
            None if line.starts_with('#') || line.trim().is_empty() => return None,
            None => line,
        };

        let fields: Vec<&str> = line.split('\t').collect();
        let &[domain, subdomains, path, secure, expires, name, value] = fields.as_slice() else {
            return None;
        };
        Some(Self {
            domain,
            include_subdomains: subdomains.eq_ignore_ascii_case("TRUE"),
            path,
            secure: secure.eq_ignore_ascii_case("TRUE"),
            expires: expires.parse().unwrap_or(0),
            name,
            value,
        })
    }

    fn url(&self) -> Result<Url, LiveError> {
        let scheme = if self.secure { "https" } else { "http" };
        let host = self.domain.trim_start_matches('.');
        Url::parse(&format!("{}://{}{}", scheme, host, self.path))
            .map_err(|e| LiveError::Cookies(format!("bad cookie domain {:?}: {}", self.domain, e)))
    }

    fn set_cookie_header(&self) -> String {
        let mut header = format!("{}={}; Path={}", self.name, self.value, self.path);
        if self.include_subdomains {
            header.push_str("; Domain=");
            header.push_str(self.domain.trim_start_matches('.'));
        }
        if self.secure {
            header.push_str("; Secure");
        }
        header
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::cookie::CookieStore;

    const COOKIES: &str = "# Netscape HTTP Cookie File\n\
        \n\
        .nicovideo.jp\tTRUE\t/\tFALSE\t0\tuser_session\tuser_session_1_abc\n\
        #HttpOnly_live.nicovideo.jp\tFALSE\t/\tTRUE\t0\tnicosid\t123.456\n\
        .example.com\tTRUE\t/\tFALSE\t1\told\tgone\n\
        malformed line\n";

    #[test]
    fn parse_cookie_line() {
        let line = CookieLine::parse(".nicovideo.jp\tTRUE\t/\tFALSE\t2000000000\tuser_session\tabc").unwrap();
        assert_eq!(line.domain, ".nicovideo.jp");
        assert!(line.include_subdomains);
        assert_eq!(line.path, "/");
        assert!(!line.secure);
        assert_eq!(line.expires, 2000000000);
        assert_eq!(line.name, "user_session");
        assert_eq!(line.value, "abc");
    }

    #[test]
    fn comments_and_blank_lines_skipped() {
        assert!(CookieLine::parse("# Netscape HTTP Cookie File").is_none());
        assert!(CookieLine::parse("").is_none());
        assert!(CookieLine::parse("only\tthree\tfields").is_none());
    }

    #[test]
    fn http_only_prefix_is_a_cookie() {
        let line = CookieLine::parse("#HttpOnly_live.nicovideo.jp\tFALSE\t/\tTRUE\t0\tnicosid\t1").unwrap();
        assert_eq!(line.domain, "live.nicovideo.jp");
        assert!(line.secure);
    }

    #[test]
    fn jar_serves_cookies_to_matching_hosts() {
        let AuthContext::Cookies(jar) = AuthContext::from_cookie_str(COOKIES).unwrap() else {
            panic!("Expected cookie context");
        };

        let url = Url::parse("http://live.nicovideo.jp/api/getplayerstatus").unwrap();
        let header = jar.cookies(&url).unwrap();
        let header = header.to_str().unwrap();
        assert!(header.contains("user_session=user_session_1_abc"));
        // secure cookie is not sent over plain http
        assert!(!header.contains("nicosid"));

        let secure = Url::parse("https://live.nicovideo.jp/").unwrap();
        let header = jar.cookies(&secure).unwrap();
        assert!(header.to_str().unwrap().contains("nicosid=123.456"));

        // expired cookie was dropped
        let other = Url::parse("http://example.com/").unwrap();
        assert!(jar.cookies(&other).is_none());
    }

    #[test]
    fn empty_file_is_an_error() {
        assert!(matches!(
            AuthContext::from_cookie_str("# Netscape HTTP Cookie File\n"),
            Err(LiveError::Cookies(_))
        ));
    }

    #[tokio::test]
    async fn load_from_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cookies.txt");
        std::fs::write(&path, COOKIES).unwrap();
        let auth = AuthContext::from_cookie_file(&path).await.unwrap();
        assert!(!auth.logs_in());

        assert!(matches!(
            AuthContext::from_cookie_file(&tmp.path().join("missing.txt")).await,
            Err(LiveError::Cookies(_))
        ));
    }

    #[test]
    fn debug_redacts_password() {
        let auth = AuthContext::credentials("me@example.com", "hunter2");
        let printed = format!("{:?}", auth);
        assert!(printed.contains("me@example.com"));
        assert!(!printed.contains("hunter2"));
        assert!(auth.logs_in());
    }
}
