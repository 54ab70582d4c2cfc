//! Fixed directive blocks written by the transaction manager, and input validation
//! for the values interpolated into them.

use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

/// Name of the snippet inserted by `secure`
pub const SECURITY_SNIPPET: &str = "warden_security";

/// Directive that pulls the security snippet into a site block
pub const SECURITY_IMPORT: &str = "import warden_security";

/// Performance stanza placed in the global options block by `optimize`
pub const PERFORMANCE_DIRECTIVES: &str = "\tservers {
\t\tprotocols h1 h2 h3
\t\ttimeouts {
\t\t\tread_body 10s
\t\t\tread_header 10s
\t\t\twrite 30s
\t\t\tidle 2m
\t\t}
\t\tmax_header_size 16KB
\t}
";

/// Security headers snippet inserted by `secure`
pub const SECURITY_BLOCK: &str = "(warden_security) {
\theader {
\t\tStrict-Transport-Security \"max-age=31536000; includeSubDomains; preload\"
\t\tX-Content-Type-Options nosniff
\t\tX-Frame-Options SAMEORIGIN
\t\tReferrer-Policy strict-origin-when-cross-origin
\t\tPermissions-Policy \"geolocation=(), microphone=(), camera=()\"
\t\t-Server
\t\t-X-Powered-By
\t}
}
";

fn domain_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(\*\.)?([A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?\.)+[A-Za-z]{2,63}$")
            .expect("domain pattern is valid")
    })
}

fn upstream_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(https?://)?([A-Za-z0-9]([A-Za-z0-9.-]*[A-Za-z0-9])?|\[[0-9A-Fa-f:]+\])?:([0-9]{1,5})$")
            .expect("upstream pattern is valid")
    })
}

/// Strict hostname check: RFC 1123 labels, at least two labels, alphabetic TLD
pub fn is_valid_domain(domain: &str) -> bool {
    domain.len() <= 253 && domain_pattern().is_match(domain)
}

/// `host:port`, `:port` or `http(s)://host:port`, with the port in 1..=65535
pub fn is_valid_upstream(upstream: &str) -> bool {
    upstream_pattern()
        .captures(upstream)
        .and_then(|caps| caps.get(4))
        .and_then(|port| port.as_str().parse::<u32>().ok())
        .map(|port| (1..=65535).contains(&port))
        .unwrap_or(false)
}

/// Site block for a reverse-proxied domain
pub fn site_block(domain: &str, upstream: &str, log_dir: &Path) -> String {
    let log_file = log_dir.join(format!("{}.log", domain.trim_start_matches("*.")));
    format!(
        "{domain} {{
\treverse_proxy {upstream}
\ttls {{
\t\tprotocols tls1.2 tls1.3
\t}}
\tencode zstd gzip
\tlog {{
\t\toutput file {log} {{
\t\t\troll_size 100mb
\t\t\troll_keep 10
\t\t}}
\t\tformat json
\t}}
}}
",
        domain = domain,
        upstream = upstream,
        log = log_file.display()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caddyfile::CaddyDocument;

    #[test]
    fn test_valid_domains() {
        for domain in ["example.com", "www.example.com", "a-b.example.co.uk", "*.example.com", "xn--bcher-kva.example"] {
            assert!(is_valid_domain(domain), "{} should be valid", domain);
        }
    }

    #[test]
    fn test_invalid_domains() {
        for domain in [
            "",
            "localhost",
            "example",
            "-bad.example.com",
            "bad-.example.com",
            "exa mple.com",
            "example.com/path",
            "example.com { }",
            "example.123",
            "http://example.com",
        ] {
            assert!(!is_valid_domain(domain), "{} should be invalid", domain);
        }
    }

    #[test]
    fn test_upstreams() {
        for upstream in ["localhost:8080", "127.0.0.1:3000", ":9000", "http://app:80", "[::1]:8080"] {
            assert!(is_valid_upstream(upstream), "{} should be valid", upstream);
        }
        for upstream in ["localhost", "localhost:0", "localhost:70000", "host:port", "a b:80", "localhost:80 {"] {
            assert!(!is_valid_upstream(upstream), "{} should be invalid", upstream);
        }
    }

    #[test]
    fn test_site_block_parses_as_one_site() {
        let text = site_block("example.com", "localhost:8080", Path::new("/var/log/caddy"));
        let doc = CaddyDocument::parse(&text).unwrap();
        assert_eq!(doc.site_identifiers(), vec!["example.com"]);
        assert_eq!(doc.site_upstream("example.com").as_deref(), Some("localhost:8080"));
        assert!(text.contains("protocols tls1.2 tls1.3"));
        assert!(text.contains("output file /var/log/caddy/example.com.log"));
    }

    #[test]
    fn test_fixed_blocks_are_balanced() {
        let doc = CaddyDocument::parse(SECURITY_BLOCK).unwrap();
        assert!(doc.contains_snippet(SECURITY_SNIPPET));
        let global = format!("{{\n{}}}\n", PERFORMANCE_DIRECTIVES);
        let doc = CaddyDocument::parse(&global).unwrap();
        assert!(doc.global().is_some());
    }
}
