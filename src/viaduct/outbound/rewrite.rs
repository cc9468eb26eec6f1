use std::sync::OnceLock;

use regex::Regex;

/// Auth header rewritten on the designated upstreams.
pub const T5_AUTH_HEADER: &str = "X-T5-Auth";

/// Placeholder value the request is built with; replaced with the computed
/// token just before wire transmission.
pub const T5_AUTH_SENTINEL: &str = "bd_x_t5_auth";

/// User-Agent forced alongside the auth rewrite.
pub const T5_USER_AGENT: &str = "okhttp/4.9.0 Dalvik/2.1.0 baiduboxapp";

/// China Unicom WAP proxy and the host it expects to see.
pub const WAP_PROXY_ADDR: &str = "10.0.0.172";
pub const WAP_MASQUERADE_HOST: &str = "ysj.iread.wo.com.cn";

/// Upstreams whose CONNECT requests carry the `X-T5-Auth` token.
pub fn is_t5_upstream(host: &str) -> bool {
    matches!(host, "cloudnproxy.baidu.com" | "cloudwiseproxy.baidu.com")
}

pub fn is_wap_upstream(host: &str) -> bool {
    host == WAP_PROXY_ADDR
}

/// Computes the `X-T5-Auth` token for a hostname.
///
/// The recurrence runs in signed 32-bit arithmetic with wraparound:
/// `i = ((i * 1318293) & 0x7FFFFFFF) + c` per byte, then a final sign mask.
/// Must produce identical output for identical input on every platform.
pub fn auth_token(s: &str) -> String {
    let mut acc: i32 = 0;
    for &b in s.as_bytes() {
        acc = (acc.wrapping_mul(1_318_293) & 0x7FFF_FFFF).wrapping_add(i32::from(b));
    }
    if acc < 0 {
        acc &= 0x7FFF_FFFF;
    }
    acc.to_string()
}

fn host_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Host: ([^:\r\n]+)(:\d+)?\r\n").expect("host line regex"))
}

/// Rewrites a serialized HTTP/1.1 request for the t5-auth upstreams: strips
/// the port from the `Host:` line and substitutes the sentinel auth value
/// with the token computed from the hostname.
///
/// Applying this to an already-rewritten request is a no-op: the `Host:` line
/// has no port left to strip and the sentinel is gone.
pub fn rewrite_t5_request(serialized: &str) -> String {
    let re = host_line_re();
    let Some(caps) = re.captures(serialized) else {
        return serialized.to_string();
    };
    let hostname = caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default();

    let host_line = format!("Host: {hostname}\r\n");
    let out = re.replace(serialized, regex::NoExpand(&host_line));

    let sentinel_line = format!("{T5_AUTH_HEADER}: {T5_AUTH_SENTINEL}\r\n");
    let token_line = format!("{T5_AUTH_HEADER}: {}\r\n", auth_token(&hostname));
    out.replace(&sentinel_line, &token_line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_vectors() {
        // Vectors computed from the recurrence.
        assert_eq!(auth_token(""), "0");
        assert_eq!(auth_token("a"), "97");
        assert_eq!(auth_token("example.com"), "1321448409");
        assert_eq!(auth_token("m.example.com"), "958387820");
    }

    #[test]
    fn token_is_deterministic() {
        assert_eq!(auth_token("m.example.com"), auth_token("m.example.com"));
    }

    #[test]
    fn rewrite_strips_port_and_substitutes_token() {
        let wire = "CONNECT m.example.com:8443 HTTP/1.1\r\n\
                    Host: m.example.com:8443\r\n\
                    User-Agent: okhttp/4.9.0 Dalvik/2.1.0 baiduboxapp\r\n\
                    X-T5-Auth: bd_x_t5_auth\r\n\
                    Proxy-Connection: Keep-Alive\r\n\
                    \r\n";
        let out = rewrite_t5_request(wire);
        assert!(out.contains("Host: m.example.com\r\n"));
        assert!(!out.contains("Host: m.example.com:8443\r\n"));
        assert!(out.contains(&format!("X-T5-Auth: {}\r\n", auth_token("m.example.com"))));
        assert!(!out.contains(T5_AUTH_SENTINEL));
    }

    #[test]
    fn rewrite_is_idempotent() {
        let wire = "CONNECT m.example.com:8443 HTTP/1.1\r\n\
                    Host: m.example.com:8443\r\n\
                    X-T5-Auth: bd_x_t5_auth\r\n\
                    \r\n";
        let once = rewrite_t5_request(wire);
        let twice = rewrite_t5_request(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn rewrite_without_host_line_is_passthrough() {
        let wire = "CONNECT a:1 HTTP/1.1\r\n\r\n";
        assert_eq!(rewrite_t5_request(wire), wire);
    }

    #[test]
    fn upstream_triggers() {
        assert!(is_t5_upstream("cloudnproxy.baidu.com"));
        assert!(is_t5_upstream("cloudwiseproxy.baidu.com"));
        assert!(!is_t5_upstream("example.com"));
        assert!(is_wap_upstream("10.0.0.172"));
        assert!(!is_wap_upstream("10.0.0.173"));
    }
}
