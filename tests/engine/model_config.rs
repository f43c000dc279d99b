use storyloom::config::{Component, ModelConfig};
use storyloom::{EngineRequest, UserTier};

use super::engine_harness::{ScriptedChat, test_engine, valid_model_config};

#[tokio::test]
async fn config_without_api_key_is_rejected_and_nothing_changes() {
    let t = test_engine(ScriptedChat::new()).await;
    let before = t.engine.model_snapshot();

    let accepted = t.engine.set_model_config(
        Component::Writer,
        "gpt-4.1",
        &ModelConfig {
            api_key: None,
            ..valid_model_config()
        },
    );

    assert!(!accepted);
    let after = t.engine.model_snapshot();
    assert_eq!(after.version(), before.version());
    assert!(!after.is_overridden(Component::Writer));
    assert!(t.factory.created().is_empty());

    let response = t
        .engine
        .generate(&EngineRequest::new("Mira at the harbour"), UserTier::Free)
        .await;
    assert_eq!(response.debug.model.as_deref(), Some("gpt-4o-mini"));
}

#[tokio::test]
async fn malformed_base_url_and_empty_model_are_rejected() {
    let t = test_engine(ScriptedChat::new()).await;

    let bad_url = ModelConfig {
        base_url: Some("not a url".into()),
        ..valid_model_config()
    };
    assert!(!t.engine.set_model_config(Component::Director, "m", &bad_url));
    assert!(!t.engine.set_model_config(Component::Director, "  ", &valid_model_config()));
    assert_eq!(t.engine.model_snapshot().version(), 0);
}

#[tokio::test]
async fn accepted_config_only_touches_its_component() {
    let t = test_engine(ScriptedChat::new()).await;
    let in_flight = t.engine.model_snapshot();

    assert!(
        t.engine
            .set_model_config(Component::Writer, "gpt-4.1", &valid_model_config())
    );

    let current = t.engine.model_snapshot();
    assert_eq!(current.version(), in_flight.version() + 1);
    assert!(current.is_overridden(Component::Writer));
    for other in [
        Component::Understanding,
        Component::Director,
        Component::Consistency,
    ] {
        assert!(!current.is_overridden(other));
    }
    assert!(!in_flight.is_overridden(Component::Writer));
    assert_eq!(t.factory.created(), vec!["writer".to_string()]);

    let limits = t.engine.limits_for(UserTier::Vip).clone();
    let writer = current.resolve(Component::Writer, &limits);
    assert_eq!(writer.model_id, "gpt-4.1");
    assert!((writer.temperature - 0.4).abs() < f64::EPSILON);
    let director = current.resolve(Component::Director, &limits);
    assert_eq!(director.model_id, "gpt-4o");

    let response = t
        .engine
        .generate(&EngineRequest::new("Mira at the harbour"), UserTier::Free)
        .await;
    assert!(!response.is_error());
    assert_eq!(response.debug.model.as_deref(), Some("gpt-4.1"));
}
