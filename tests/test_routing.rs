//! Tests for host suffix matching and backend path resolution

use std::path::PathBuf;
use std::sync::Arc;

use outpost::config::Config;
use outpost::routing::{Backend, DirSpec, Host, ProxySpec, RouteTable};

fn dir_backend(root: &str) -> Arc<Backend> {
    Arc::new(Backend::Dir(DirSpec {
        root: PathBuf::from(root),
        index_file: "index.html".to_string(),
    }))
}

fn proxy_backend(host: &str, port: u16) -> Arc<Backend> {
    Arc::new(Backend::Proxy(ProxySpec {
        host: host.to_string(),
        port,
    }))
}

#[test]
fn test_resolve_host_exact_match() {
    let mut table = RouteTable::new();
    table.add_host(Host::new("example.com"));

    let host = table.resolve_host("example.com").unwrap();
    assert_eq!(host.name, "example.com");
}

#[test]
fn test_resolve_host_suffix_match() {
    let mut table = RouteTable::new();
    table.add_host(Host::new("example.com"));

    let host = table.resolve_host("mail.example.com").unwrap();
    assert_eq!(host.name, "example.com");
}

#[test]
fn test_resolve_host_requires_label_boundary() {
    let mut table = RouteTable::new();
    table.add_host(Host::new("example.com"));

    // notexample.com is not a subdomain of example.com
    assert!(table.resolve_host("notexample.com").is_none());
}

#[test]
fn test_resolve_host_longest_suffix_wins() {
    let mut table = RouteTable::new();
    table.add_host(Host::new("example.com"));
    table.add_host(Host::new("mail.example.com"));

    let host = table.resolve_host("imap.mail.example.com").unwrap();
    assert_eq!(host.name, "mail.example.com");

    let host = table.resolve_host("www.example.com").unwrap();
    assert_eq!(host.name, "example.com");
}

#[test]
fn test_resolve_host_tie_breaks_by_registration_order() {
    // the same suffix registered twice: first registration wins
    let mut table = RouteTable::new();
    let mut first = Host::new("example.com");
    first.add_route("/a", dir_backend("a/"));
    table.add_host(first);
    table.add_host(Host::new("example.com"));

    let host = table.resolve_host("example.com").unwrap();
    assert!(host.resolve_backend("/a").is_some());
}

#[test]
fn test_resolve_host_falls_back_to_default() {
    let mut table = RouteTable::new();
    table.add_host(Host::new("example.com"));
    let fallback = table.add_host(Host::new("fallback"));
    table.set_default_host(fallback);

    let host = table.resolve_host("unknown.org").unwrap();
    assert_eq!(host.name, "fallback");
}

#[test]
fn test_resolve_host_no_match_without_default() {
    let mut table = RouteTable::new();
    table.add_host(Host::new("example.com"));

    assert!(table.resolve_host("unknown.org").is_none());
}

#[test]
fn test_resolve_backend_first_match_wins() {
    let mut host = Host::new("example.com");
    host.add_route("/static/images", dir_backend("images/"));
    host.add_route("/static", dir_backend("static/"));

    let (_, pattern) = host.resolve_backend("/static/images/logo.png").unwrap();
    assert_eq!(pattern, "/static/images");

    let (_, pattern) = host.resolve_backend("/static/app.css").unwrap();
    assert_eq!(pattern, "/static");
}

#[test]
fn test_resolve_backend_registration_order_breaks_overlap() {
    // overlapping patterns are legal; order decides
    let mut host = Host::new("example.com");
    host.add_route("/api", proxy_backend("10.0.0.1", 8080));
    host.add_route("/", dir_backend("public/"));

    let (backend, pattern) = host.resolve_backend("/api/users").unwrap();
    assert_eq!(pattern, "/api");
    assert!(matches!(backend.as_ref(), Backend::Proxy(_)));

    let (backend, pattern) = host.resolve_backend("/anything").unwrap();
    assert_eq!(pattern, "/");
    assert!(matches!(backend.as_ref(), Backend::Dir(_)));
}

#[test]
fn test_resolve_backend_default_fallback() {
    let mut host = Host::new("example.com");
    host.add_route("/api", proxy_backend("10.0.0.1", 8080));
    host.set_default(dir_backend("public/"));

    let (backend, pattern) = host.resolve_backend("/somewhere/else").unwrap();
    assert_eq!(pattern, "");
    assert!(matches!(backend.as_ref(), Backend::Dir(_)));
}

#[test]
fn test_resolve_backend_not_found() {
    let mut host = Host::new("example.com");
    host.add_route("/api", proxy_backend("10.0.0.1", 8080));

    assert!(host.resolve_backend("/somewhere/else").is_none());
}

#[test]
fn test_resolution_is_idempotent() {
    let mut table = RouteTable::new();
    let mut host = Host::new("example.com");
    host.add_route("/api", proxy_backend("10.0.0.1", 8080));
    host.add_route("/", dir_backend("public/"));
    table.add_host(host);

    let first_host = table.resolve_host("www.example.com").unwrap();
    let second_host = table.resolve_host("www.example.com").unwrap();
    assert!(Arc::ptr_eq(&first_host, &second_host));

    let (first, p1) = first_host.resolve_backend("/api/users").unwrap();
    let (second, p2) = second_host.resolve_backend("/api/users").unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(p1, p2);
}

#[test]
fn test_table_from_config() {
    let yaml = r#"
server:
  listen_addr: "127.0.0.1:6767"
  default_host: "localhost"
hosts:
  - name: "localhost"
    routes:
      - pattern: "/api"
        proxy: { url: "http://10.0.0.1:8080" }
      - pattern: "/"
        directory: { root: "public/" }
  - name: "example.com"
    routes:
      - pattern: "@chat"
        handler: { ident: "chat-1", send_addr: "127.0.0.1:9997" }
"#;

    let cfg = Config::from_yaml(yaml).unwrap();
    let table = RouteTable::from_config(&cfg).unwrap();

    // the named default host answers unknown hostnames
    let host = table.resolve_host("unknown.org").unwrap();
    assert_eq!(host.name, "localhost");

    let (backend, pattern) = host.resolve_backend("/api/users").unwrap();
    assert_eq!(pattern, "/api");
    match backend.as_ref() {
        Backend::Proxy(spec) => {
            assert_eq!(spec.host, "10.0.0.1");
            assert_eq!(spec.port, 8080);
        }
        other => panic!("expected proxy backend, got {}", other.kind()),
    }

    let host = table.resolve_host("example.com").unwrap();
    let (backend, _) = host.resolve_backend("@chat").unwrap();
    match backend.as_ref() {
        Backend::Handler(spec) => assert_eq!(spec.ident, "chat-1"),
        other => panic!("expected handler backend, got {}", other.kind()),
    }
}

#[test]
fn test_table_from_config_rejects_unknown_default_host() {
    let yaml = r#"
server:
  listen_addr: "127.0.0.1:6767"
  default_host: "missing"
hosts:
  - name: "localhost"
"#;

    let cfg = Config::from_yaml(yaml).unwrap();
    assert!(RouteTable::from_config(&cfg).is_err());
}
