//! Route list parsing.
//!
//! Format: `[[host:]port:]pathPrefix:targetPath`, entries separated by commas.
//! A missing port means "any port"; the path prefix always gains a trailing
//! slash.

use super::{RouteError, RouteSpec};

/// Parse a comma separated route list. Blank entries are skipped.
pub fn parse_applications(list: &str) -> Result<Vec<RouteSpec>, RouteError> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(parse_application)
        .collect()
}

/// Parse a single `[[host:]port:]pathPrefix:targetPath` entry.
pub fn parse_application(entry: &str) -> Result<RouteSpec, RouteError> {
    let fields: Vec<&str> = entry.split(':').collect();
    let (host, port, prefix, target) = match fields.as_slice() {
        [prefix, target] => (None, None, *prefix, *target),
        [port, prefix, target] => (None, Some(parse_port(entry, port)?), *prefix, *target),
        [host, port, prefix, target] => (
            Some(host.to_string()),
            Some(parse_port(entry, port)?),
            *prefix,
            *target,
        ),
        _ => {
            return Err(RouteError::Parse {
                entry: entry.to_string(),
                reason: "expected [[host:]port:]path:target",
            })
        }
    };

    if target.is_empty() {
        return Err(RouteError::Parse {
            entry: entry.to_string(),
            reason: "empty target path",
        });
    }
    if !prefix.starts_with('/') {
        return Err(RouteError::InvalidPrefix(prefix.to_string()));
    }

    Ok(RouteSpec {
        host: host.filter(|h| !h.is_empty()),
        port,
        prefix: normalize_prefix(prefix),
        target: target.to_string(),
        endpoint: None,
    })
}

pub(crate) fn normalize_prefix(prefix: &str) -> String {
    if prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{prefix}/")
    }
}

fn parse_port(entry: &str, port: &str) -> Result<u16, RouteError> {
    port.trim().parse().map_err(|_| RouteError::InvalidPort {
        entry: entry.to_string(),
        port: port.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("/:/srv/root", None, None, "/", "/srv/root")]
    #[case("/app:/srv/app", None, None, "/app/", "/srv/app")]
    #[case("8080:/app/:/srv/app", None, Some(8080), "/app/", "/srv/app")]
    #[case("www.test:80:/blog:/srv/blog", Some("www.test"), Some(80), "/blog/", "/srv/blog")]
    #[case("*.test:443:/:/srv/any", Some("*.test"), Some(443), "/", "/srv/any")]
    fn parses_entry_forms(
        #[case] input: &str,
        #[case] host: Option<&str>,
        #[case] port: Option<u16>,
        #[case] prefix: &str,
        #[case] target: &str,
    ) {
        let spec = parse_application(input).unwrap();
        assert_eq!(spec.host.as_deref(), host);
        assert_eq!(spec.port, port);
        assert_eq!(spec.prefix, prefix);
        assert_eq!(spec.target, target);
    }

    #[rstest]
    #[case("/only")]
    #[case("a:b:c:d:e")]
    #[case("/app:")]
    fn rejects_wrong_shapes(#[case] input: &str) {
        assert!(matches!(parse_application(input), Err(RouteError::Parse { .. })));
    }

    #[test]
    fn rejects_bad_port_and_prefix() {
        assert!(matches!(
            parse_application("eighty:/app:/srv"),
            Err(RouteError::InvalidPort { .. })
        ));
        assert!(matches!(
            parse_application("70000:/app:/srv"),
            Err(RouteError::InvalidPort { .. })
        ));
        assert!(matches!(
            parse_application("app:/srv"),
            Err(RouteError::InvalidPrefix(_))
        ));
    }

    #[test]
    fn list_keeps_order_and_skips_blanks() {
        let specs = parse_applications("/:/srv/root, ,8080:/app:/srv/app,").unwrap();
        let prefixes: Vec<_> = specs.iter().map(|s| s.prefix.as_str()).collect();
        assert_eq!(prefixes, ["/", "/app/"]);
    }
}
