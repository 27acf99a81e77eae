use probe_plane::config::RuntimeConfig;
use probe_plane::domain::LifecycleState;
use probe_plane::export::CollectingSink;
use probe_plane::handlers::HandlerRegistry;
use probe_plane::runtime::ClientRegistry;
use probe_plane_common::Command;

fn attach(registry: &ClientRegistry, name: &str, sink: &CollectingSink) -> String {
    registry
        .attach(RuntimeConfig::new(name), HandlerRegistry::new(), sink.clone())
        .unwrap()
        .client_name()
        .to_string()
}

#[test]
fn test_duplicate_names_get_suffixes() {
    let registry = ClientRegistry::new();
    let sinks: Vec<CollectingSink> = (0..3).map(|_| CollectingSink::new()).collect();

    assert_eq!(attach(&registry, "trace", &sinks[0]), "trace");
    assert_eq!(attach(&registry, "trace", &sinks[1]), "trace$1");
    assert_eq!(attach(&registry, "trace", &sinks[2]), "trace$2");
    assert_eq!(registry.names(), vec!["trace", "trace$1", "trace$2"]);

    assert_eq!(registry.shutdown(0), 3);
    assert!(registry.is_empty());

    // The renamed clients hear about it before anything else
    assert!(sinks[0].snapshot().iter().all(|cmd| !matches!(cmd, Command::Rename { .. })));
    assert_eq!(sinks[1].snapshot().first(), Some(&Command::Rename { new_name: "trace$1".into() }));
    assert_eq!(sinks[2].snapshot().first(), Some(&Command::Rename { new_name: "trace$2".into() }));
}

#[test]
fn test_detach_exits_client() {
    let registry = ClientRegistry::new();
    let sink = CollectingSink::new();
    attach(&registry, "solo", &sink);
    let runtime = registry.get("solo").unwrap();

    assert!(registry.detach("solo", 3));
    assert!(!registry.detach("solo", 3));
    assert_eq!(runtime.state(), LifecycleState::Terminated);
    assert_eq!(sink.snapshot().last(), Some(&Command::exit(3)));
    assert!(registry.get("solo").is_none());
}

#[test]
fn test_terminated_clients_release_their_names() {
    let registry = ClientRegistry::new();
    let first = CollectingSink::new();
    attach(&registry, "reuse", &first);
    registry.get("reuse").unwrap().exit(0);

    let second = CollectingSink::new();
    assert_eq!(attach(&registry, "reuse", &second), "reuse");
    assert_eq!(registry.len(), 1);
    registry.shutdown(0);
}
