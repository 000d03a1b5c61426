// Tests for exported host functions and modules
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::*;

// ==================== Test structs ====================

#[derive(HostRecord)]
pub struct Account {
    pub owner: String,
    pub balance: i64,
}

struct MathModule;

impl HostModule for MathModule {
    fn name(&self) -> &str {
        "myModule"
    }

    fn exported_functions(&self) -> Vec<Arc<dyn HostFunction>> {
        vec![add_fn("myAdd"), host_fn("myNeg", |frame| {
            let n = frame.to_number(1);
            frame.push(-n)?;
            Ok(1)
        })]
    }
}

fn add_fn(name: &str) -> Arc<dyn HostFunction> {
    host_fn(name.to_string(), |frame| {
        let a = frame.to_integer(1);
        let b = frame.to_integer(2);
        frame.push(a + b)?;
        Ok(1)
    })
}

// ==================== Functions ====================

#[test]
fn test_exported_function() {
    let bridge = Bridge::new(true).unwrap();
    bridge.export_function(add_fn("myAdd")).unwrap();
    bridge.load_and_run("return myAdd(2, 3)", "").unwrap();
    assert_eq!(bridge.read_as::<i64>(-1).unwrap(), 5);
}

#[test]
fn test_function_result_count() {
    let bridge = Bridge::new(true).unwrap();
    bridge
        .export_function(host_fn("split", |frame| {
            frame.push("discarded")?;
            frame.push(1)?;
            frame.push(2)?;
            Ok(2)
        }))
        .unwrap();
    bridge
        .export_function(host_fn("pad", |frame| {
            frame.push(true)?;
            Ok(3)
        }))
        .unwrap();
    bridge
        .load_and_run("local a, b, c = split() local x, y, z = pad() return a, b, c, x, y, z", "")
        .unwrap();
    assert_eq!(bridge.read_as::<i64>(1).unwrap(), 1);
    assert_eq!(bridge.read_as::<i64>(2).unwrap(), 2);
    assert!(bridge.engine().is_nil(3));
    // missing results are padded with nil
    assert!(bridge.engine().to_bool(4));
    assert!(bridge.engine().is_nil(5));
    assert!(bridge.engine().is_nil(6));
}

#[test]
fn test_call_frame_arguments() {
    let bridge = Bridge::new(true).unwrap();
    bridge
        .export_function(host_fn("describe", |frame| {
            let summary = format!(
                "{}|{}|{}|{}|{}",
                frame.get_top(),
                frame.to_string(1),
                frame.to_number(2),
                frame.to_bool(3),
                frame.is_nil(4)
            );
            frame.push(summary)?;
            Ok(1)
        }))
        .unwrap();
    bridge.load_and_run("return describe(12, '2.5', false, nil)", "").unwrap();
    assert_eq!(bridge.read_as::<String>(-1).unwrap(), "4|12|2.5|false|true");
}

#[test]
fn test_missing_arguments_read_as_defaults() {
    let bridge = Bridge::new(true).unwrap();
    bridge
        .export_function(host_fn("defaults", |frame| {
            frame.push(frame.to_integer(1))?;
            frame.push(frame.to_string(2))?;
            frame.push(frame.is_nil(3))?;
            Ok(3)
        }))
        .unwrap();
    bridge.load_and_run("return defaults()", "").unwrap();
    assert_eq!(bridge.read_as::<i64>(1).unwrap(), 0);
    assert_eq!(bridge.read_as::<String>(2).unwrap(), "");
    assert!(bridge.engine().to_bool(3));
}

#[test]
fn test_function_receives_host_objects() {
    let account = Shared::new(Account {
        owner: "kim".to_string(),
        balance: 10,
    });
    let bridge = Bridge::new(true).unwrap();
    bridge
        .export_function(host_fn("deposit", |frame| {
            let account: Shared<Account> = frame.to_host(1)?;
            let amount: i64 = frame.to_host(2)?;
            let mut guard = account.lock();
            guard.balance += amount;
            let balance = guard.balance;
            drop(guard);
            frame.push(balance)?;
            Ok(1)
        }))
        .unwrap();
    bridge.push_value(account.clone()).unwrap();
    bridge.engine().set_global("acct").unwrap();

    bridge.load_and_run("return deposit(acct, 5)", "").unwrap();
    assert_eq!(bridge.read_as::<i64>(-1).unwrap(), 15);
    assert_eq!(account.lock().balance, 15);
}

#[test]
fn test_function_returns_host_objects() {
    let bridge = Bridge::new(true).unwrap();
    bridge
        .export_function(host_fn("open", |frame| {
            let owner = frame.to_string(1);
            frame.push(Account { owner, balance: 0 })?;
            Ok(1)
        }))
        .unwrap();
    bridge
        .load_and_run("local a = open('lee') a.balance = 3 return a.owner, a.balance", "")
        .unwrap();
    assert_eq!(bridge.read_as::<String>(1).unwrap(), "lee");
    assert_eq!(bridge.read_as::<i64>(2).unwrap(), 3);
}

#[test]
fn test_function_error_reaches_script() {
    let bridge = Bridge::new(true).unwrap();
    bridge
        .export_function(host_fn("fail", |_| Err(BridgeError::Host("nope".to_string()))))
        .unwrap();

    let err = bridge.load_and_run("fail()", "").unwrap_err();
    assert!(matches!(err, BridgeError::Runtime { ref message, .. } if message.contains("nope")));
    assert!(matches!(err.cause(), Some(BridgeError::Host(msg)) if msg == "nope"));
    assert!(std::error::Error::source(&err).is_some());

    bridge
        .load_and_run("local ok, err = pcall(fail) return ok, tostring(err)", "")
        .unwrap();
    assert!(!bridge.engine().to_bool(1));
    assert!(bridge.read_as::<String>(2).unwrap().contains("nope"));
}

#[test]
fn test_function_handle_is_callable_value() {
    let bridge = Bridge::new(true).unwrap();
    bridge.export_function(add_fn("myAdd")).unwrap();
    bridge
        .load_and_run("local f = myAdd return f(1, 1), f(2, 2), type(f), #f", "")
        .unwrap();
    assert_eq!(bridge.read_as::<i64>(1).unwrap(), 2);
    assert_eq!(bridge.read_as::<i64>(2).unwrap(), 4);
    assert_eq!(bridge.read_as::<String>(3).unwrap(), "userdata");
    assert_eq!(bridge.read_as::<i64>(4).unwrap(), 0);
}

#[test]
fn test_function_member_access_fails() {
    let bridge = Bridge::new(true).unwrap();
    bridge.export_function(add_fn("myAdd")).unwrap();
    let err = bridge.load_and_run("return myAdd.x", "").unwrap_err();
    assert!(matches!(err, BridgeError::Runtime { .. }));
}

#[test]
fn test_function_value_round_trips() {
    let func = add_fn("myAdd");
    let bridge = Bridge::new(true).unwrap();
    bridge.push_value(Arc::clone(&func)).unwrap();
    let back: Arc<dyn HostFunction> = bridge.read_as(-1).unwrap();
    assert!(std::ptr::addr_eq(Arc::as_ptr(&back), Arc::as_ptr(&func)));
}

// ==================== Modules ====================

#[test]
fn test_module_functions() {
    let bridge = Bridge::new(true).unwrap();
    bridge.export_module(Arc::new(MathModule)).unwrap();
    bridge
        .load_and_run("return myModule.myAdd(3, 3), myModule.myNeg(2), myModule.missing", "")
        .unwrap();
    assert_eq!(bridge.read_as::<i64>(1).unwrap(), 6);
    assert_eq!(bridge.read_as::<f64>(2).unwrap(), -2.0);
    assert!(bridge.engine().is_nil(3));
}

#[test]
fn test_module_members_register_lazily() {
    let bridge = Bridge::new(true).unwrap();
    bridge.export_module(Arc::new(MathModule)).unwrap();
    assert_eq!(bridge.registry().len(), 1);

    bridge.load_and_run("local f = myModule.myAdd", "").unwrap();
    assert_eq!(bridge.registry().len(), 2);

    // later reads reuse the cached member
    bridge
        .load_and_run("return myModule.myAdd == myModule.myAdd", "")
        .unwrap();
    assert!(bridge.engine().to_bool(-1));
    assert_eq!(bridge.registry().len(), 2);
}

#[test]
fn test_module_members_are_case_sensitive() {
    let bridge = Bridge::new(true).unwrap();
    bridge.export_module(Arc::new(MathModule)).unwrap();
    bridge.load_and_run("return myModule.myadd, myModule[1]", "").unwrap();
    assert!(bridge.engine().is_nil(1));
    assert!(bridge.engine().is_nil(2));
}

#[test]
fn test_module_is_not_callable() {
    let bridge = Bridge::new(true).unwrap();
    bridge.export_module(Arc::new(MathModule)).unwrap();
    let err = bridge.load_and_run("myModule()", "").unwrap_err();
    assert!(matches!(err, BridgeError::Runtime { ref message, .. } if message.contains("attempt to call")));
}

#[test]
fn test_function_group() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let group = FunctionGroup::new("tools")
        .with(add_fn("add"))
        .with(host_fn("tick", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(0)
        }));
    assert_eq!(group.exported_functions().len(), 2);

    let bridge = Bridge::new(true).unwrap();
    bridge.export_module(Arc::new(group)).unwrap();
    bridge
        .load_and_run("tools.tick() tools.tick() return tools.add(1, 2)", "")
        .unwrap();
    assert_eq!(bridge.read_as::<i64>(-1).unwrap(), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
