//! Registry and Instance Lifecycle Tests
//!
//! Covers creation, activation, reset and the entity allocator as seen by a
//! host driving several domains.

use progs_vm_core::progs_vm_bytecode::{
    EType, GlobalIndex, Opcode, ProgramBuilder, ProgramFormatError, ProgramImage,
};
use progs_vm_core::{
    AccessError, CallState, Domain, EntityIndex, InstanceOptions, LoadOptions, VmError,
    VmRegistry, Value,
};

/// `main` adds `step` to `counter`; `counter` starts at 1
fn counter_program() -> Vec<u8> {
    let mut b = ProgramBuilder::new();
    b.global("time", EType::Float);
    let counter = b.global("counter", EType::Float);
    b.set_initial(counter, 1.0f32.to_bits());
    let step = b.global("step", EType::Float);
    b.field("health", EType::Float);
    b.function("main", &[], &[]);
    b.emit(Opcode::AddF, counter, step, counter);
    b.ret(GlobalIndex::NONE);
    b.to_bytes()
}

fn counter(registry: &VmRegistry, domain: Domain) -> Value {
    registry.get(domain).unwrap().global_value("counter").unwrap()
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_domains_are_independent() {
    let bytes = counter_program();
    let mut registry = VmRegistry::new();
    for domain in Domain::ALL {
        registry
            .create(domain, &bytes, &InstanceOptions::with_capacity(4))
            .unwrap();
    }

    registry
        .get_mut(Domain::Client)
        .unwrap()
        .set_global_value("step", Value::Float(10.0))
        .unwrap();
    registry.bind(Domain::Client).unwrap();
    registry.execute_by_name("main", "frame").unwrap();

    assert_eq!(counter(&registry, Domain::Client), Value::Float(11.0));
    assert_eq!(counter(&registry, Domain::Server), Value::Float(1.0));
    assert_eq!(counter(&registry, Domain::Ui), Value::Float(1.0));
    assert_eq!(registry.get(Domain::Server).unwrap().call_state(), CallState::Ready);
}

#[test]
fn test_execute_in_requires_active_domain() {
    let mut registry = VmRegistry::new();
    registry
        .create(Domain::Server, &counter_program(), &InstanceOptions::default())
        .unwrap();
    registry
        .create(Domain::Ui, &counter_program(), &InstanceOptions::default())
        .unwrap();
    let main = registry.get(Domain::Server).unwrap().find_function("main").unwrap();

    let err = registry.execute_in(Domain::Server, main, "frame").unwrap_err();
    assert!(matches!(
        err,
        VmError::WrongVmActive {
            requested: Domain::Server,
            active: None
        }
    ));

    assert_eq!(registry.bind(Domain::Ui).unwrap(), None);
    let err = registry.execute_in(Domain::Server, main, "frame").unwrap_err();
    assert_eq!(err.to_string(), "server VM is not active (active: ui)");

    assert_eq!(registry.bind(Domain::Server).unwrap(), Some(Domain::Ui));
    registry.execute_in(Domain::Server, main, "frame").unwrap();
    assert_eq!(registry.unbind(), Some(Domain::Server));
    assert!(matches!(registry.active_instance(), Err(VmError::NoActiveVm)));
}

#[test]
fn test_missing_instance() {
    let mut registry = VmRegistry::new();
    assert!(matches!(registry.get(Domain::Client), Err(VmError::NoInstance(Domain::Client))));
    assert!(matches!(registry.destroy(Domain::Client), Err(VmError::NoInstance(Domain::Client))));
    assert!(matches!(registry.reset(Domain::Client), Err(VmError::NoInstance(Domain::Client))));
}

#[test]
fn test_destroy_then_recreate() {
    let bytes = counter_program();
    let mut registry = VmRegistry::new();
    registry
        .create(Domain::Server, &bytes, &InstanceOptions::default())
        .unwrap();
    registry.bind(Domain::Server).unwrap();
    registry.execute_by_name("main", "frame").unwrap();

    let old = registry.destroy(Domain::Server).unwrap();
    assert_eq!(old.domain(), Domain::Server);
    assert!(!registry.contains(Domain::Server));

    registry
        .create(Domain::Server, &bytes, &InstanceOptions::default())
        .unwrap();
    assert_eq!(counter(&registry, Domain::Server), Value::Float(1.0));
}

#[test]
fn test_reset_restores_initial_state() {
    let mut registry = VmRegistry::new();
    let vm = registry
        .create(Domain::Server, &counter_program(), &InstanceOptions::with_capacity(4))
        .unwrap();
    vm.set_global_value("step", Value::Float(2.0)).unwrap();
    vm.execute_by_name("main", "frame").unwrap();
    let ent = vm.spawn().unwrap();
    vm.set_field_value(ent, "health", Value::Float(50.0)).unwrap();
    let zoned = vm.alloc_string("zoned");

    registry.reset(Domain::Server).unwrap();

    let vm = registry.get(Domain::Server).unwrap();
    assert_eq!(vm.global_value("counter").unwrap(), Value::Float(1.0));
    assert_eq!(vm.global_value("step").unwrap(), Value::Float(0.0));
    assert_eq!(vm.entities().in_use(), 1);
    assert!(vm.resolve_string(zoned).is_err());
    assert_eq!(vm.instructions(), 0);
    assert_eq!(vm.profiles().count(), 0);
}

// ============================================================================
// Loading
// ============================================================================

#[test]
fn test_checksum_mismatch_rejected() {
    let bytes = counter_program();
    let checksum = ProgramImage::from_bytes(&bytes).unwrap().checksum();
    let mut registry = VmRegistry::new();

    let wrong = InstanceOptions {
        load: LoadOptions {
            expected_checksum: Some(checksum.wrapping_add(1)),
            ..LoadOptions::default()
        },
        ..InstanceOptions::default()
    };
    let err = registry.create(Domain::Server, &bytes, &wrong).unwrap_err();
    assert!(matches!(
        err,
        VmError::ProgramFormat(ProgramFormatError::ChecksumMismatch { .. })
    ));
    assert!(!registry.contains(Domain::Server));

    let right = InstanceOptions {
        load: LoadOptions {
            expected_checksum: Some(checksum),
            ..LoadOptions::default()
        },
        ..InstanceOptions::default()
    };
    registry.create(Domain::Server, &bytes, &right).unwrap();
}

#[test]
fn test_missing_required_global() {
    let options = InstanceOptions {
        load: LoadOptions {
            required_globals: vec!["time".into(), "frametime".into()],
            ..LoadOptions::default()
        },
        ..InstanceOptions::default()
    };
    let err = VmRegistry::new()
        .create(Domain::Client, &counter_program(), &options)
        .unwrap_err();
    match err {
        VmError::ProgramFormat(ProgramFormatError::MissingRequired { kind, name }) => {
            assert_eq!(kind, "global");
            assert_eq!(name, "frametime");
        }
        other => panic!("expected missing global, got {other}"),
    }
}

#[test]
fn test_truncated_image_rejected() {
    let bytes = counter_program();
    let err = VmRegistry::new()
        .create(Domain::Ui, &bytes[..bytes.len() / 2], &InstanceOptions::default())
        .unwrap_err();
    assert!(matches!(err, VmError::ProgramFormat(_)));
}

#[test]
fn test_zero_capacity_rejected() {
    let err = VmRegistry::new()
        .create(Domain::Server, &counter_program(), &InstanceOptions::with_capacity(0))
        .unwrap_err();
    assert!(matches!(err, VmError::InvalidOptions(_)));
}

// ============================================================================
// Entities
// ============================================================================

#[test]
fn test_entity_allocation() {
    let mut registry = VmRegistry::new();
    let vm = registry
        .create(Domain::Server, &counter_program(), &InstanceOptions::with_capacity(4))
        .unwrap();

    let a = vm.spawn().unwrap();
    let b = vm.spawn().unwrap();
    assert_eq!((a, b), (EntityIndex(1), EntityIndex(2)));

    let handle = vm.entities().handle(b).unwrap();
    assert_eq!(vm.entities().index(handle).unwrap(), b);

    // freed slots come back immediately during startup
    vm.remove(a).unwrap();
    assert_eq!(vm.spawn().unwrap(), a);

    // later, a freed slot waits before reuse
    vm.set_global_value("time", Value::Float(30.0)).unwrap();
    vm.remove(b).unwrap();
    assert_eq!(vm.spawn().unwrap(), EntityIndex(3));
    assert!(matches!(
        vm.spawn(),
        Err(VmError::Access(AccessError::EntitiesExhausted { capacity: 4 }))
    ));

    vm.set_global_value("time", Value::Float(31.0)).unwrap();
    assert_eq!(vm.spawn().unwrap(), b);

    assert!(matches!(
        vm.remove(EntityIndex::WORLD),
        Err(VmError::Access(AccessError::WorldEntity))
    ));
}
