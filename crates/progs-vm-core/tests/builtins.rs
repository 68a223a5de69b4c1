//! Builtin Dispatch Tests
//!
//! Host functions called from programs:
//! - Binding policies for undeclared and wrong-domain builtins
//! - Argument accessors and return values
//! - Aborts and re-entry into the program

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use progs_vm_core::progs_vm_bytecode::{
    EType, GlobalIndex, OFS_RETURN, Opcode, ProgramBuilder,
};
use progs_vm_core::{
    BuiltinBinding, CallState, Domain, DomainMask, EntityIndex, InstanceOptions, Interrupt,
    VmConfig, VmError, VmRegistry, Value,
};

const RETURN: GlobalIndex = GlobalIndex(OFS_RETURN);

/// A program whose `main` calls builtin `name` with no arguments
fn calls_builtin(name: &str) -> Vec<u8> {
    let mut b = ProgramBuilder::new();
    let builtin = b.builtin(name, &[]);
    b.function("main", &[], &[]);
    b.call(builtin.handle, 0);
    b.ret(GlobalIndex::NONE);
    b.to_bytes()
}

fn counting_builtin(registry: &mut VmRegistry, name: &str, domains: DomainMask) -> Arc<AtomicUsize> {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    registry
        .register_builtin(name, domains, move |_ctx| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
    calls
}

fn create_bound(registry: &mut VmRegistry, domain: Domain, bytes: &[u8]) {
    registry
        .create(domain, bytes, &InstanceOptions::with_capacity(8))
        .unwrap();
    registry.bind(domain).unwrap();
}

// ============================================================================
// Binding
// ============================================================================

#[test]
fn test_undeclared_builtin_fails_at_load() {
    let mut registry = VmRegistry::new();
    let err = registry
        .create(
            Domain::Server,
            &calls_builtin("precache_sound"),
            &InstanceOptions::default(),
        )
        .unwrap_err();
    match err {
        VmError::UnresolvedBuiltin { domain, name, .. } => {
            assert_eq!(domain, Domain::Server);
            assert_eq!(name, "precache_sound");
        }
        other => panic!("expected unresolved builtin, got {other}"),
    }
    assert!(!registry.contains(Domain::Server));
}

#[test]
fn test_wrong_domain_builtin_fails_at_load_when_strict() {
    let mut registry = VmRegistry::new();
    let calls = counting_builtin(&mut registry, "sound", DomainMask::SERVER);
    let err = registry
        .create(
            Domain::Client,
            &calls_builtin("sound"),
            &InstanceOptions::default(),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        VmError::UnresolvedBuiltin {
            domain: Domain::Client,
            ..
        }
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_wrong_domain_builtin_never_runs_when_deferred() {
    let mut registry = VmRegistry::with_config(VmConfig {
        builtin_binding: BuiltinBinding::Deferred,
        ..VmConfig::default()
    });
    let calls = counting_builtin(&mut registry, "sound", DomainMask::SERVER);
    create_bound(&mut registry, Domain::Client, &calls_builtin("sound"));

    let err = registry.execute_by_name("main", "test").unwrap_err();
    let exec = err.as_execution().expect("execution error");
    assert!(exec.detail.contains("`sound`"), "{}", exec.detail);
    assert_eq!(exec.function, "main");
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let client = registry.get(Domain::Client).unwrap();
    assert_eq!(client.call_state(), CallState::Interrupted(Interrupt::Error));

    // the same program on the server reaches the builtin
    create_bound(&mut registry, Domain::Server, &calls_builtin("sound"));
    registry.execute_by_name("main", "test").unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_registration_errors() {
    let mut registry = VmRegistry::new();
    registry
        .register_builtin("print", DomainMask::ALL, |_| Ok(()))
        .unwrap();
    assert!(matches!(
        registry.register_builtin("print", DomainMask::UI, |_| Ok(())),
        Err(VmError::Registration(_))
    ));
    assert!(matches!(
        registry.register_builtin("never", DomainMask::NONE, |_| Ok(())),
        Err(VmError::Registration(_))
    ));
    assert_eq!(registry.builtins().len(), 1);
}

// ============================================================================
// Arguments and Return Values
// ============================================================================

#[test]
fn test_arguments_and_returns() {
    let mut registry = VmRegistry::new();
    registry
        .register_builtin("vlen", DomainMask::ALL, |ctx| {
            let [x, y, z] = ctx.arg_vector(0)?;
            ctx.return_float((x * x + y * y + z * z).sqrt());
            Ok(())
        })
        .unwrap();
    registry
        .register_builtin("ftos", DomainMask::ALL, |ctx| {
            let value = ctx.arg_float(0)?;
            ctx.return_string(format!("{value}"));
            Ok(())
        })
        .unwrap();
    registry
        .register_builtin("strlen", DomainMask::ALL, |ctx| {
            let len = ctx.arg_bytes(0)?.len();
            ctx.return_float(len as f32);
            Ok(())
        })
        .unwrap();

    let mut b = ProgramBuilder::new();
    let len = b.global("len", EType::Float);
    let text = b.global("text", EType::String);
    let chars = b.global("chars", EType::Float);
    let v = b.constant_vector([3.0, 0.0, 4.0]);
    let vlen = b.builtin("vlen", &[EType::Vector]);
    let ftos = b.builtin("ftos", &[EType::Float]);
    let strlen = b.builtin("strlen", &[EType::String]);
    b.function("main", &[], &[]);
    b.arg(0, v, EType::Vector);
    b.call(vlen.handle, 1);
    b.emit(Opcode::StoreF, RETURN, len, GlobalIndex::NONE);
    b.arg(0, len, EType::Float);
    b.call(ftos.handle, 1);
    b.emit(Opcode::StoreS, RETURN, text, GlobalIndex::NONE);
    b.arg(0, text, EType::String);
    b.call(strlen.handle, 1);
    b.emit(Opcode::StoreF, RETURN, chars, GlobalIndex::NONE);
    b.ret(GlobalIndex::NONE);

    create_bound(&mut registry, Domain::Ui, &b.to_bytes());
    registry.execute_by_name("main", "test").unwrap();

    let vm = registry.get(Domain::Ui).unwrap();
    assert_eq!(vm.global_value("len").unwrap(), Value::Float(5.0));
    let Value::String(handle) = vm.global_value("text").unwrap() else {
        panic!("text is a string");
    };
    assert_eq!(vm.resolve_string(handle).unwrap(), b"5");
    assert_eq!(vm.global_value("chars").unwrap(), Value::Float(1.0));

    let main = vm.find_function("main").unwrap();
    assert_eq!(vm.profile(main).builtin_calls, 3);
    let ftos = vm.find_function("ftos").unwrap();
    assert_eq!(vm.profile(ftos).calls, 1);
}

#[test]
fn test_argument_beyond_argc_faults() {
    let mut registry = VmRegistry::new();
    registry
        .register_builtin("second", DomainMask::ALL, |ctx| {
            let value = ctx.arg_float(1)?;
            ctx.return_float(value);
            Ok(())
        })
        .unwrap();

    let mut b = ProgramBuilder::new();
    let one = b.constant_float(1.0);
    let second = b.builtin("second", &[EType::Float, EType::Float]);
    b.function("main", &[], &[]);
    b.arg(0, one, EType::Float);
    let call = b.call(second.handle, 1);
    b.ret(GlobalIndex::NONE);

    create_bound(&mut registry, Domain::Server, &b.to_bytes());
    let err = registry.execute_by_name("main", "test").unwrap_err();
    let exec = err.as_execution().expect("execution error");
    assert_eq!(exec.detail, "argument 1 out of range (1 passed)");
    assert_eq!(exec.statement, call);
}

#[test]
fn test_entities_and_persistent_strings_from_builtins() {
    let mut registry = VmRegistry::new();
    registry
        .register_builtin("spawn", DomainMask::SERVER, |ctx| {
            let entity = ctx.vm_mut().spawn()?;
            ctx.return_entity(entity);
            Ok(())
        })
        .unwrap();
    registry
        .register_builtin("strzone", DomainMask::SERVER, |ctx| {
            let text = ctx.arg_string(0)?;
            let handle = ctx.vm_mut().alloc_string(text);
            ctx.return_string_handle(handle);
            Ok(())
        })
        .unwrap();

    let mut b = ProgramBuilder::new();
    let ent = b.global("ent", EType::Entity);
    let name = b.global("name", EType::String);
    let classname = b.field("classname", EType::String);
    let ptr = b.global("ptr", EType::Pointer);
    let monster = b.constant_string("monster_ogre");
    let spawn = b.builtin("spawn", &[]);
    let strzone = b.builtin("strzone", &[EType::String]);
    b.function("main", &[], &[]);
    b.call(spawn.handle, 0);
    b.emit(Opcode::StoreEnt, RETURN, ent, GlobalIndex::NONE);
    b.arg(0, monster, EType::String);
    b.call(strzone.handle, 1);
    b.emit(Opcode::StoreS, RETURN, name, GlobalIndex::NONE);
    b.emit(Opcode::Address, ent, classname.global, ptr);
    b.emit(Opcode::StorePS, name, ptr, GlobalIndex::NONE);
    b.ret(GlobalIndex::NONE);

    create_bound(&mut registry, Domain::Server, &b.to_bytes());
    registry.execute_by_name("main", "test").unwrap();

    let vm = registry.get_mut(Domain::Server).unwrap();
    assert_eq!(vm.global_value("ent").unwrap(), Value::Entity(EntityIndex(1)));
    let Value::String(handle) = vm.field_value(EntityIndex(1), "classname").unwrap() else {
        panic!("classname is a string");
    };
    assert_eq!(vm.resolve_string(handle).unwrap(), b"monster_ogre");
    assert_eq!(vm.strings().live_persistent(), 1);
    vm.free_string(handle).unwrap();
    assert!(vm.resolve_string(handle).is_err());
}

// ============================================================================
// Control
// ============================================================================

#[test]
fn test_abort_unwinds_the_call() {
    let mut registry = VmRegistry::new();
    registry
        .register_builtin("error", DomainMask::ALL, |ctx| {
            let message = ctx.arg_string(0)?;
            ctx.abort(message)
        })
        .unwrap();

    let mut b = ProgramBuilder::new();
    let reached = b.global("reached", EType::Float);
    let one = b.constant_float(1.0);
    let message = b.constant_string("bad spawn");
    let error = b.builtin("error", &[EType::String]);
    let fail = b.function("fail", &[], &[EType::Float]);
    b.arg(0, message, EType::String);
    b.call(error.handle, 1);
    b.emit(Opcode::StoreF, one, reached, GlobalIndex::NONE);
    b.ret(GlobalIndex::NONE);
    b.function("main", &[], &[]);
    b.call(fail.handle, 0);
    b.ret(GlobalIndex::NONE);

    create_bound(&mut registry, Domain::Server, &b.to_bytes());
    let err = registry.execute_by_name("main", "test").unwrap_err();
    assert!(matches!(err, VmError::HostRequestedAbort(ref msg) if msg == "bad spawn"));

    let vm = registry.get(Domain::Server).unwrap();
    assert_eq!(vm.call_state(), CallState::Interrupted(Interrupt::Abort));
    assert_eq!(vm.context().depth(), 0);
    assert_eq!(vm.context().locals_used(), 0);
    assert_eq!(vm.global_value("reached").unwrap(), Value::Float(0.0));
}

/// `main` passes `callee` to the `repeat` builtin, then marks `done`
fn reentry_program(callee_spins: bool) -> Vec<u8> {
    let mut b = ProgramBuilder::new();
    let counter = b.global("counter", EType::Float);
    let done = b.global("done", EType::Float);
    let one = b.constant_float(1.0);
    let repeat = b.builtin("repeat", &[EType::Function, EType::Float]);

    let callee = b.function("callee", &[], &[]);
    b.emit(Opcode::AddF, counter, one, counter);
    if callee_spins {
        b.goto(0);
    }
    b.ret(GlobalIndex::NONE);

    let times = b.constant_float(3.0);
    b.function("main", &[], &[]);
    b.arg(0, callee.handle, EType::Function);
    b.arg(1, times, EType::Float);
    b.call(repeat.handle, 2);
    b.emit(Opcode::StoreF, one, done, GlobalIndex::NONE);
    b.ret(GlobalIndex::NONE);
    b.to_bytes()
}

fn register_repeat(registry: &mut VmRegistry) {
    registry
        .register_builtin("repeat", DomainMask::ALL, |ctx| {
            let function = ctx.arg_function(0)?;
            let times = ctx.arg_float(1)? as usize;
            for _ in 0..times {
                ctx.call(function)?;
            }
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_builtin_reentry_resumes_caller() {
    let mut registry = VmRegistry::new();
    register_repeat(&mut registry);
    create_bound(&mut registry, Domain::Server, &reentry_program(false));
    registry.execute_by_name("main", "test").unwrap();

    let vm = registry.get(Domain::Server).unwrap();
    assert_eq!(vm.global_value("counter").unwrap(), Value::Float(3.0));
    assert_eq!(vm.global_value("done").unwrap(), Value::Float(1.0));
    assert_eq!(vm.call_state(), CallState::Returned);
    // main runs 5 statements, each nested call 2
    assert_eq!(vm.instructions(), 5 + 3 * 2);
}

#[test]
fn test_reentry_shares_the_instruction_budget() {
    let mut registry = VmRegistry::with_config(VmConfig {
        max_instructions: 500,
        ..VmConfig::default()
    });
    register_repeat(&mut registry);
    create_bound(&mut registry, Domain::Server, &reentry_program(true));

    let err = registry.execute_by_name("main", "test").unwrap_err();
    assert!(matches!(err, VmError::Runaway { ref function, limit: 500, .. } if function == "callee"));

    let vm = registry.get(Domain::Server).unwrap();
    assert_eq!(vm.instructions(), 501);
    assert_eq!(vm.context().depth(), 0);
    assert_eq!(vm.global_value("done").unwrap(), Value::Float(0.0));
    assert_eq!(vm.call_state(), CallState::Interrupted(Interrupt::Runaway));
}

/// `main` hands `callee` to `try_call`, which discards the nested result,
/// then marks `done`; `after` runs cleanly on its own
fn discarding_program(callee_aborts: bool) -> Vec<u8> {
    let mut b = ProgramBuilder::new();
    let done = b.global("done", EType::Float);
    let nothing = b.global("nothing", EType::Function);
    let one = b.constant_float(1.0);
    let message = b.constant_string("no spawn point");
    let try_call = b.builtin("try_call", &[EType::Function]);
    let error = b.builtin("error", &[EType::String]);

    let callee = b.function("callee", &[], &[]);
    if callee_aborts {
        b.arg(0, message, EType::String);
        b.call(error.handle, 1);
    } else {
        b.call(nothing, 0);
    }
    b.ret(GlobalIndex::NONE);

    b.function("main", &[], &[]);
    b.arg(0, callee.handle, EType::Function);
    b.call(try_call.handle, 1);
    b.emit(Opcode::StoreF, one, done, GlobalIndex::NONE);
    b.ret(GlobalIndex::NONE);

    b.function("after", &[], &[]);
    b.emit(Opcode::StoreF, one, done, GlobalIndex::NONE);
    b.ret(GlobalIndex::NONE);
    b.to_bytes()
}

fn register_discarding(registry: &mut VmRegistry) -> Arc<AtomicUsize> {
    let retries = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&retries);
    registry
        .register_builtin("try_call", DomainMask::ALL, move |ctx| {
            let function = ctx.arg_function(0)?;
            let first = ctx.call(function);
            assert!(first.is_err());
            // a second attempt is refused without running
            if ctx.call(function).is_err() {
                seen.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        })
        .unwrap();
    registry
        .register_builtin("error", DomainMask::ALL, |ctx| {
            let message = ctx.arg_string(0)?;
            ctx.abort(message)
        })
        .unwrap();
    retries
}

#[test]
fn test_discarded_nested_fault_aborts_outer_call() {
    let mut registry = VmRegistry::new();
    let retries = register_discarding(&mut registry);
    create_bound(&mut registry, Domain::Server, &discarding_program(false));

    let err = registry.execute_by_name("main", "test").unwrap_err();
    let exec = err.as_execution().expect("execution error");
    assert_eq!(exec.detail, "NULL function");
    assert_eq!(exec.function, "callee");
    assert_eq!(retries.load(Ordering::SeqCst), 1);

    let vm = registry.get(Domain::Server).unwrap();
    assert_eq!(vm.call_state(), CallState::Interrupted(Interrupt::Error));
    assert_eq!(vm.global_value("done").unwrap(), Value::Float(0.0));
    assert_eq!(vm.context().depth(), 0);
    assert_eq!(vm.context().locals_used(), 0);
    let callee = vm.find_function("callee").unwrap();
    assert_eq!(vm.profile(callee).calls, 1);

    // the fault does not leak into the next call
    registry.execute_by_name("after", "test").unwrap();
    let vm = registry.get(Domain::Server).unwrap();
    assert_eq!(vm.call_state(), CallState::Returned);
    assert_eq!(vm.global_value("done").unwrap(), Value::Float(1.0));
}

#[test]
fn test_discarded_nested_abort_aborts_outer_call() {
    let mut registry = VmRegistry::new();
    register_discarding(&mut registry);
    create_bound(&mut registry, Domain::Server, &discarding_program(true));

    let err = registry.execute_by_name("main", "test").unwrap_err();
    assert!(matches!(err, VmError::HostRequestedAbort(ref msg) if msg == "no spawn point"));

    let vm = registry.get(Domain::Server).unwrap();
    assert_eq!(vm.call_state(), CallState::Interrupted(Interrupt::Abort));
    assert_eq!(vm.global_value("done").unwrap(), Value::Float(0.0));
    assert_eq!(vm.context().depth(), 0);
}
