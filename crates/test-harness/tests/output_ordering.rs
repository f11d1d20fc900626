//! Property: after init, index 0 satisfies the primary-selection rule.

use proptest::prelude::*;
use test_harness::fixtures::init_display;
use test_harness::software::OutputConfig;
use tdm::{ConnStatus, ConnectorType};

fn connector_strategy() -> impl Strategy<Value = ConnectorType> {
    prop_oneof![
        Just(ConnectorType::Dsi),
        Just(ConnectorType::Lvds),
        Just(ConnectorType::HdmiA),
        Just(ConnectorType::HdmiB),
        Just(ConnectorType::Vga),
        Just(ConnectorType::Unknown),
    ]
}

/// Independent oracle for the selection rule: with anything connected,
/// DSI > LVDS > HDMI-A > HDMI-B among connected outputs, else the first
/// connected one; with nothing connected, HDMI-A > HDMI-B > DSI > LVDS,
/// else position 0.
fn expected_primary(outputs: &[(ConnectorType, bool)]) -> usize {
    if outputs.len() <= 1 {
        return 0;
    }
    let any_connected = outputs.iter().any(|(_, connected)| *connected);
    if any_connected {
        for wanted in [
            ConnectorType::Dsi,
            ConnectorType::Lvds,
            ConnectorType::HdmiA,
            ConnectorType::HdmiB,
        ] {
            if let Some(i) = outputs.iter().position(|(ty, c)| *ty == wanted && *c) {
                return i;
            }
        }
        outputs.iter().position(|(_, c)| *c).unwrap_or(0)
    } else {
        for wanted in [
            ConnectorType::HdmiA,
            ConnectorType::HdmiB,
            ConnectorType::Dsi,
            ConnectorType::Lvds,
        ] {
            if let Some(i) = outputs.iter().position(|(ty, _)| *ty == wanted) {
                return i;
            }
        }
        0
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn primary_output_selection_matches_rule(
        setup in prop::collection::vec((connector_strategy(), any::<bool>()), 1..5),
    ) {
        let configs: Vec<OutputConfig> = setup
            .iter()
            .enumerate()
            .map(|(i, (connector_type, connected))| OutputConfig {
                connector_type: *connector_type,
                status: if *connected { ConnStatus::Connected } else { ConnStatus::Disconnected },
                model: format!("panel-{i}"),
                ..OutputConfig::default()
            })
            .collect();

        let fixture = init_display(configs);
        let primary = fixture.display.get_output(0).unwrap();

        let expected = expected_primary(&setup);
        prop_assert_eq!(primary.connector_type().unwrap(), setup[expected].0);
        let expected_status = if setup[expected].1 {
            ConnStatus::Connected
        } else {
            ConnStatus::Disconnected
        };
        prop_assert_eq!(primary.conn_status().unwrap(), expected_status);

        // Models carry the original identity; every output is still there.
        prop_assert_eq!(fixture.display.output_count().unwrap(), setup.len());
        let (_, model, _) = primary.model_info().unwrap();
        let expected_prefix = format!("panel-{}", expected);
        let has_prefix = model.starts_with(&expected_prefix);
        prop_assert!(has_prefix);
    }
}
