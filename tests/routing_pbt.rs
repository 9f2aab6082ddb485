//! Property tests for the routing gate and context enrichment.

use proptest::prelude::*;
use serde_json::json;
use switchboard::{
    decide_route, passes_gate, Classification, ContextCaps, ContextEnricher, OrchestratorConfig,
    Session, SessionId, SwitchReason,
};

fn cls(domain: &str, confidence: f64, complexity: u8) -> Classification {
    Classification {
        domain: domain.to_string(),
        confidence,
        complexity,
    }
}

proptest! {
    #[test]
    fn gate_is_exactly_both_strict_thresholds(
        confidence in 0.0f64..=1.0,
        complexity in 0u8..=10,
    ) {
        let cfg = OrchestratorConfig::default();
        let expected = confidence > 0.70 && complexity > 3;
        prop_assert_eq!(
            passes_gate(&cls("security", confidence, complexity), &cfg),
            expected
        );
    }

    #[test]
    fn fresh_sessions_always_route_when_gated(
        confidence in 0.71f64..=1.0,
        complexity in 4u8..=10,
    ) {
        let cfg = OrchestratorConfig::default();
        let session = Session::new(SessionId::from("s"));
        let c = cls("security", confidence, complexity);
        prop_assume!(passes_gate(&c, &cfg));

        let d = decide_route(&session, &c, "security_specialist".to_string(), &cfg);
        prop_assert!(d.should_route);
        prop_assert_eq!(d.switch_reason, SwitchReason::NewSession);
    }

    #[test]
    fn established_sessions_never_switch_inside_the_margin(
        stored in 0.0f64..=1.0,
        confidence in 0.0f64..=1.0,
    ) {
        let cfg = OrchestratorConfig::default();
        let mut session = Session::new(SessionId::from("s"));
        session.push_agent("finops_agent");
        session.last_confidence = Some(stored);

        let d = decide_route(
            &session,
            &cls("security", confidence, 8),
            "security_specialist".to_string(),
            &cfg,
        );
        let margin_cleared = confidence > 0.70 && confidence - stored > 0.20;
        prop_assert_eq!(d.should_route, margin_cleared);
        if !margin_cleared {
            prop_assert_eq!(d.switch_reason, SwitchReason::None);
        }
    }

    #[test]
    fn same_target_never_reroutes(
        confidence in 0.0f64..=1.0,
        complexity in 0u8..=10,
    ) {
        let cfg = OrchestratorConfig::default();
        let mut session = Session::new(SessionId::from("s"));
        session.push_agent("security_specialist");

        let d = decide_route(
            &session,
            &cls("security", confidence, complexity),
            "security_specialist".to_string(),
            &cfg,
        );
        prop_assert!(!d.should_route);
    }

    #[test]
    fn context_never_exceeds_the_cumulative_cap(
        payloads in prop::collection::vec(
            prop::collection::btree_map("[a-z]{1,8}", "[a-z]{0,64}", 1..6),
            1..20,
        ),
    ) {
        let caps = ContextCaps { payload_bytes: 256, total_bytes: 1024 };
        let enricher = ContextEnricher::new(caps);
        let mut context = Vec::new();

        for payload in &payloads {
            let value = json!(payload);
            enricher.merge(&mut context, &value);
            let total: usize = context.iter().map(|e| e.size_bytes()).sum();
            prop_assert!(total <= caps.total_bytes, "total {} over cap", total);
        }
    }

    #[test]
    fn merged_keys_are_unique_and_newest_wins(
        first in "[a-z]{1,6}",
        second in "[a-z]{1,6}",
    ) {
        let enricher = ContextEnricher::new(ContextCaps::default());
        let mut context = Vec::new();
        enricher.merge(&mut context, &json!({ first.as_str(): "one" }));
        enricher.merge(&mut context, &json!({ second.as_str(): "two" }));
        enricher.merge(&mut context, &json!({ first.as_str(): "three" }));

        let occurrences = context.iter().filter(|e| e.key == first).count();
        prop_assert_eq!(occurrences, 1);
        let entry = context.iter().find(|e| e.key == first).unwrap();
        prop_assert_eq!(&entry.value, &json!("three"));
        prop_assert_eq!(context.last().map(|e| e.key.as_str()), Some(first.as_str()));
    }
}
