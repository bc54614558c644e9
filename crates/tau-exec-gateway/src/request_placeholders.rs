//! Per-request placeholder values exposed to argument templates.

use std::net::SocketAddr;

use axum::extract::Query;
use axum::http::{header, Request};
use tau_exec::PlaceholderResolver;

const REQUEST_PREFIX: &str = "http.request";

/// Builds the placeholder map for one request.
///
/// Keys: `http.request.method`, `.uri`, `.uri.path`, `.uri.query`,
/// `.uri.query.<name>`, `.host`, `.hostport`, `.header.<name>` (lowercased),
/// `.remote`, `.remote.host`, `.remote.port`.
pub fn request_placeholder_resolver<B>(
    request: &Request<B>,
    remote: Option<SocketAddr>,
) -> PlaceholderResolver {
    let mut resolver = PlaceholderResolver::new();
    let uri = request.uri();

    resolver.insert(format!("{REQUEST_PREFIX}.method"), request.method().as_str());
    resolver.insert(
        format!("{REQUEST_PREFIX}.uri"),
        uri.path_and_query()
            .map(|value| value.as_str())
            .unwrap_or_else(|| uri.path()),
    );
    resolver.insert(format!("{REQUEST_PREFIX}.uri.path"), uri.path());
    resolver.insert(
        format!("{REQUEST_PREFIX}.uri.query"),
        uri.query().unwrap_or_default(),
    );
    if let Ok(Query(pairs)) = Query::<Vec<(String, String)>>::try_from_uri(uri) {
        for (name, value) in pairs {
            let key = format!("{REQUEST_PREFIX}.uri.query.{name}");
            if resolver.get(&key).is_none() {
                resolver.insert(key, value);
            }
        }
    }

    let host_port = request
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| uri.authority().map(|authority| authority.to_string()))
        .unwrap_or_default();
    resolver.insert(format!("{REQUEST_PREFIX}.host"), split_host(&host_port));
    resolver.insert(format!("{REQUEST_PREFIX}.hostport"), host_port);

    for name in request.headers().keys() {
        let joined = request
            .headers()
            .get_all(name)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .collect::<Vec<_>>()
            .join(",");
        resolver.insert(format!("{REQUEST_PREFIX}.header.{}", name.as_str()), joined);
    }

    if let Some(remote) = remote {
        resolver.insert(format!("{REQUEST_PREFIX}.remote"), remote.to_string());
        resolver.insert(
            format!("{REQUEST_PREFIX}.remote.host"),
            remote.ip().to_string(),
        );
        resolver.insert(
            format!("{REQUEST_PREFIX}.remote.port"),
            remote.port().to_string(),
        );
    }
    resolver
}

fn split_host(host_port: &str) -> &str {
    if let Some(rest) = host_port.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host_port.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => {
            host
        }
        _ => host_port,
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use axum::body::Body;
    use axum::http::Request;
    use tau_exec::ArgumentResolver;

    use super::{request_placeholder_resolver, split_host};

    #[test]
    fn unit_split_host_handles_ports_and_ipv6() {
        assert_eq!(split_host("example.com:8080"), "example.com");
        assert_eq!(split_host("example.com"), "example.com");
        assert_eq!(split_host("[::1]:8080"), "::1");
        assert_eq!(split_host("::1"), "::1");
        assert_eq!(split_host(""), "");
    }

    #[test]
    fn functional_resolver_exposes_request_fields() {
        let request = Request::builder()
            .method("POST")
            .uri("/deploy/app?env=prod&env=staging&tag=v1%202")
            .header("host", "build.local:8080")
            .header("X-Token", "secret")
            .header("accept", "text/plain")
            .header("accept", "application/json")
            .body(Body::empty())
            .expect("request");
        let remote: SocketAddr = "10.0.0.7:51234".parse().expect("remote addr");
        let resolver = request_placeholder_resolver(&request, Some(remote));

        assert_eq!(resolver.resolve("{http.request.method}"), "POST");
        assert_eq!(
            resolver.resolve("{http.request.uri}"),
            "/deploy/app?env=prod&env=staging&tag=v1%202"
        );
        assert_eq!(resolver.resolve("{http.request.uri.path}"), "/deploy/app");
        assert_eq!(
            resolver.resolve("{http.request.uri.query}"),
            "env=prod&env=staging&tag=v1%202"
        );
        assert_eq!(resolver.resolve("{http.request.uri.query.env}"), "prod");
        assert_eq!(resolver.resolve("{http.request.uri.query.tag}"), "v1 2");
        assert_eq!(resolver.resolve("{http.request.host}"), "build.local");
        assert_eq!(resolver.resolve("{http.request.hostport}"), "build.local:8080");
        assert_eq!(resolver.resolve("{http.request.header.X-Token}"), "secret");
        assert_eq!(
            resolver.resolve("{http.request.header.accept}"),
            "text/plain,application/json"
        );
        assert_eq!(resolver.resolve("{http.request.remote}"), "10.0.0.7:51234");
        assert_eq!(resolver.resolve("{http.request.remote.host}"), "10.0.0.7");
        assert_eq!(resolver.resolve("{http.request.remote.port}"), "51234");
    }

    #[test]
    fn regression_missing_values_resolve_to_empty() {
        let request = Request::builder()
            .uri("/plain")
            .body(Body::empty())
            .expect("request");
        let resolver = request_placeholder_resolver(&request, None);
        assert_eq!(resolver.resolve("[{http.request.uri.query}]"), "[]");
        assert_eq!(resolver.resolve("[{http.request.uri.query.id}]"), "[]");
        assert_eq!(resolver.resolve("[{http.request.remote}]"), "[]");
        assert_eq!(resolver.resolve("{http.request.method}"), "GET");
    }
}
