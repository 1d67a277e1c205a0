use polka::{Durability, Memo, Runtime, Signal};
use std::cell::Cell;
use std::rc::Rc;

#[test]
fn high_durability_memo_skips_low_changes() {
    let _ = env_logger::try_init();

    let runtime = Runtime::new();
    let config = Signal::new_with_durability(&runtime, "release", Durability::HIGH);
    let scratch = Signal::new(&runtime, 0);

    let computed = Rc::new(Cell::new(0));
    let mode = {
        let (config, computed) = (config.clone(), computed.clone());
        Memo::new(&runtime, move || {
            computed.set(computed.get() + 1);
            config.get().to_uppercase()
        })
    };

    assert_eq!(mode.get(), "RELEASE");
    assert_eq!(computed.get(), 1);

    // Low-durability churn: `mode` has effective durability HIGH, so
    // its verification does not even walk the dependency list.
    for i in 1..50 {
        scratch.set(i);
        assert_eq!(mode.get(), "RELEASE");
    }
    assert_eq!(computed.get(), 1);

    // A change to the high-durability input is seen normally.
    config.set("debug");
    assert_eq!(mode.get(), "DEBUG");
    assert_eq!(computed.get(), 2);
}

#[test]
fn effective_durability_is_the_minimum_of_inputs() {
    let runtime = Runtime::new();
    let config = Signal::new_with_durability(&runtime, "fmt=", Durability::HIGH);
    let n = Signal::new(&runtime, 0);

    let computed = Rc::new(Cell::new(0));
    let formatted = {
        let (config, n, computed) = (config.clone(), n.clone(), computed.clone());
        Memo::new(&runtime, move || {
            computed.set(computed.get() + 1);
            format!("{}{}", config.get(), n.get())
        })
    };

    assert_eq!(formatted.get(), "fmt=0");

    // Reading one low-durability input drags the memo's effective
    // durability down to LOW: it must notice this change.
    n.set(1);
    assert_eq!(formatted.get(), "fmt=1");
    assert_eq!(computed.get(), 2);
}

#[test]
fn medium_sits_between_low_and_high() {
    let runtime = Runtime::new();
    let low = Signal::new(&runtime, 0);
    let medium = Signal::new_with_durability(&runtime, 10, Durability::MEDIUM);
    let high = Signal::new_with_durability(&runtime, 100, Durability::HIGH);

    let medium_computed = Rc::new(Cell::new(0));
    let from_medium = {
        let (medium, medium_computed) = (medium.clone(), medium_computed.clone());
        Memo::new(&runtime, move || {
            medium_computed.set(medium_computed.get() + 1);
            medium.get() * 2
        })
    };
    let high_computed = Rc::new(Cell::new(0));
    let from_high = {
        let (high, high_computed) = (high.clone(), high_computed.clone());
        Memo::new(&runtime, move || {
            high_computed.set(high_computed.get() + 1);
            high.get() * 2
        })
    };

    assert_eq!((from_medium.get(), from_high.get()), (20, 200));

    low.set(1);
    assert_eq!((from_medium.get(), from_high.get()), (20, 200));
    assert_eq!((medium_computed.get(), high_computed.get()), (1, 1));

    // A medium change invalidates the medium-durability memo's
    // shortcut but leaves the high one untouched.
    medium.set(11);
    assert_eq!((from_medium.get(), from_high.get()), (22, 200));
    assert_eq!((medium_computed.get(), high_computed.get()), (2, 1));

    high.set(101);
    assert_eq!((from_medium.get(), from_high.get()), (22, 202));
    assert_eq!((medium_computed.get(), high_computed.get()), (2, 2));
}

#[test]
fn synthetic_write_reverifies_without_recompute() {
    let runtime = Runtime::new();
    let config = Signal::new_with_durability(&runtime, 1, Durability::HIGH);
    let computed = Rc::new(Cell::new(0));
    let doubled = {
        let (config, computed) = (config.clone(), computed.clone());
        Memo::new(&runtime, move || {
            computed.set(computed.get() + 1);
            config.get() * 2
        })
    };

    assert_eq!(doubled.get(), 2);
    let r1 = runtime.revision();

    // Acts as though a high-durability input changed: the memo must
    // walk its dependencies again, but they are unchanged, so the
    // thunk does not run.
    runtime.synthetic_write(Durability::HIGH);
    assert!(runtime.revision() > r1);
    assert_eq!(doubled.get(), 2);
    assert_eq!(computed.get(), 1);
}

#[test]
fn no_dependencies_means_never_stale() {
    let runtime = Runtime::new();
    let noise = Signal::new(&runtime, 0);
    let computed = Rc::new(Cell::new(0));
    let constant = {
        let computed = computed.clone();
        Memo::new(&runtime, move || {
            computed.set(computed.get() + 1);
            42
        })
    };

    assert_eq!(constant.get(), 42);
    noise.set(1);
    noise.set(2);
    assert_eq!(constant.get(), 42);
    assert_eq!(constant.get(), 42);
    assert_eq!(computed.get(), 1);
}
