use polka::{Memo, Runtime, Signal};
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

#[test]
fn batch_commits_once() {
    let runtime = Runtime::new();
    let x = Signal::new(&runtime, 1);
    let y = Signal::new(&runtime, 2);
    let r0 = runtime.revision();

    runtime.batch(|| {
        x.set(9);
        y.set(5);
        x.set(1);
    });

    // `x` reverted to its pre-batch value and is discarded; only `y`
    // commits, and the clock advances exactly once.
    assert_eq!(runtime.revision(), r0.next());
    assert_eq!(x.get(), 1);
    assert_eq!(y.get(), 5);
}

#[test]
fn fully_reverted_batch_is_a_no_op() {
    let runtime = Runtime::new();
    let y = Signal::new(&runtime, 2);
    let r0 = runtime.revision();

    runtime.batch(|| {
        y.set(9);
        y.set(2);
    });

    assert_eq!(runtime.revision(), r0);
    assert_eq!(y.get(), 2);
}

#[test]
fn dependents_update_once_per_batch() {
    let runtime = Runtime::new();
    let x = Signal::new(&runtime, 1);
    let y = Signal::new(&runtime, 2);
    let computed = Rc::new(Cell::new(0));
    let sum = {
        let (x, y, computed) = (x.clone(), y.clone(), computed.clone());
        Memo::new(&runtime, move || {
            computed.set(computed.get() + 1);
            x.get() + y.get()
        })
    };

    assert_eq!(sum.get(), 3);
    runtime.batch(|| {
        x.set(10);
        y.set(20);
    });
    assert_eq!(sum.get(), 30);
    assert_eq!(computed.get(), 2);
}

#[test]
fn staged_values_are_visible_to_the_batch_closure_only() {
    let runtime = Runtime::new();
    let x = Signal::new(&runtime, 1);
    let through_memo = {
        let x = x.clone();
        Memo::new(&runtime, move || x.get())
    };

    assert_eq!(through_memo.get(), 1);

    runtime.batch(|| {
        x.set(10);
        // The closure's own read observes the staged value...
        assert_eq!(x.get(), 10);
        // ...but a memo computed inside the batch reads the committed
        // state: the batch's changes are not yet visible to it.
        assert_eq!(through_memo.get(), 1);
    });

    assert_eq!(x.get(), 10);
    assert_eq!(through_memo.get(), 10);
}

#[test]
fn nested_batches_commit_at_the_outermost_exit() {
    let runtime = Runtime::new();
    let x = Signal::new(&runtime, 1);
    let r0 = runtime.revision();

    runtime.batch(|| {
        runtime.batch(|| {
            x.set(5);
        });
        // The inner exit must not have committed.
        assert_eq!(runtime.revision(), r0);
        runtime.batch(|| {
            x.set(6);
        });
    });

    assert_eq!(runtime.revision(), r0.next());
    assert_eq!(x.get(), 6);
}

#[test]
fn set_unconditional_forces_a_commit_even_when_reverted() {
    let runtime = Runtime::new();
    let x = Signal::new(&runtime, 1);
    let r0 = runtime.revision();

    runtime.batch(|| {
        x.set_unconditional(1);
    });

    assert_eq!(runtime.revision(), r0.next());
    assert_eq!(x.get(), 1);
}

#[test]
fn equal_write_inside_a_batch_stages_nothing() {
    let runtime = Runtime::new();
    let x = Signal::new(&runtime, 1);
    let r0 = runtime.revision();

    runtime.batch(|| {
        x.set(1);
    });

    assert_eq!(runtime.revision(), r0);
}

#[test]
fn batch_returns_the_closure_result() {
    let runtime = Runtime::new();
    let x = Signal::new(&runtime, 1);
    let doubled = runtime.batch(|| {
        x.set(21);
        x.get() * 2
    });
    assert_eq!(doubled, 42);
    assert_eq!(x.get(), 21);
}

#[test]
fn panicking_batch_discards_staged_values() {
    let runtime = Runtime::new();
    let x = Signal::new(&runtime, 1);
    let y = Signal::new(&runtime, 2);
    let r0 = runtime.revision();

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        runtime.batch(|| {
            x.set(100);
            y.set(200);
            panic!("boom");
        })
    }));
    assert!(result.is_err());

    assert_eq!(runtime.revision(), r0);
    assert_eq!(x.get(), 1);
    assert_eq!(y.get(), 2);

    // The runtime is still fully usable afterwards.
    x.set(3);
    assert_eq!(runtime.revision(), r0.next());
    assert_eq!(x.get(), 3);
}

#[test]
fn durability_of_committed_signals_is_honored() {
    use polka::Durability;

    let runtime = Runtime::new();
    let config = Signal::new_with_durability(&runtime, 1, Durability::HIGH);
    let scratch = Signal::new(&runtime, 0);
    let computed = Rc::new(Cell::new(0));
    let from_config = {
        let (config, computed) = (config.clone(), computed.clone());
        Memo::new(&runtime, move || {
            computed.set(computed.get() + 1);
            config.get() + 1
        })
    };

    assert_eq!(from_config.get(), 2);

    // Committing only a low-durability signal leaves the high-durability
    // shortcut intact.
    runtime.batch(|| scratch.set(1));
    assert_eq!(from_config.get(), 2);
    assert_eq!(computed.get(), 1);

    // A batch that commits the high-durability signal invalidates it.
    runtime.batch(|| config.set(5));
    assert_eq!(from_config.get(), 6);
    assert_eq!(computed.get(), 2);
}
