use std::collections::HashMap;

use isorun_core::PlatformTarget;
use isorun_core::target::{self, TARGETS};

#[test]
fn target_spellings_unique_and_resolvable() {
    let mut seen: HashMap<&'static str, PlatformTarget> = HashMap::new();

    for info in TARGETS {
        assert_eq!(
            target::from_str(info.canonical),
            Some(info.id),
            "target canonical spelling not resolvable: {}",
            info.canonical
        );
        assert_eq!(
            target::as_str(info.id),
            info.canonical,
            "target as_str mismatch for {:?}",
            info.id
        );

        if let Some(prev) = seen.insert(info.canonical, info.id) {
            panic!("duplicate target spelling {:?}: {:?} and {:?}", info.canonical, prev, info.id);
        }

        for &alias in info.aliases {
            assert_eq!(target::from_str(alias), Some(info.id), "target alias not resolvable: {}", alias);
            if let Some(prev) = seen.insert(alias, info.id) {
                panic!("duplicate target alias {:?}: {:?} and {:?}", alias, prev, info.id);
            }
        }
    }
}

#[test]
fn every_target_has_exactly_one_registry_row() {
    for id in [PlatformTarget::Linux, PlatformTarget::Windows, PlatformTarget::WindowsSimulated] {
        let rows = TARGETS.iter().filter(|t| t.id == id).count();
        assert_eq!(rows, 1, "{id:?} must appear exactly once");
        assert_eq!(target::info_for(id).id, id);
    }
}

#[test]
fn registry_order_is_matrix_order() {
    let order: Vec<PlatformTarget> = TARGETS.iter().map(|t| t.id).collect();
    assert_eq!(
        order,
        vec![PlatformTarget::Linux, PlatformTarget::Windows, PlatformTarget::WindowsSimulated]
    );
}
