use once_cell::sync::Lazy;

/// Hierarchical tracing output for test debugging, enabled by `TEST_LOG=1`.
static TRACING: Lazy<()> = Lazy::new(|| {
    use tracing_subscriber::layer::SubscriberExt;

    if std::env::var("TEST_LOG").is_err() {
        return;
    }
    let tree = tracing_tree::HierarchicalLayer::new(2)
        .with_targets(true)
        .with_bracketed_fields(true);
    let subscriber = tracing_subscriber::Registry::default().with(tree);
    tracing::subscriber::set_global_default(subscriber).unwrap();
});

pub fn setup_test_tracing() {
    Lazy::force(&TRACING);
}
