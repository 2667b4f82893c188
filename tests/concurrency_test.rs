//! Concurrency tests - shared engine used from many threads

use layerfs::{Entry, HookEvent, LayeredFs};
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::tempdir;

#[test]
fn test_concurrent_copy_up_copies_once() {
    let base = tempdir().unwrap();
    let upper = tempdir().unwrap();
    fs::write(base.path().join("shared.dat"), vec![7u8; 64 * 1024]).unwrap();

    let engine = Arc::new(LayeredFs::new());
    engine.add_layer(base.path(), false, Some("base")).unwrap();
    engine.add_layer(upper.path(), true, Some("upper")).unwrap();

    let copies = Arc::new(AtomicUsize::new(0));
    let counter = copies.clone();
    engine.on(HookEvent::AfterCopyUp, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = engine.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                engine.copy_up("shared.dat").unwrap()
            })
        })
        .collect();

    let dests: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(dests.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(copies.load(Ordering::SeqCst), 1);
    assert_eq!(fs::read(&dests[0]).unwrap(), vec![7u8; 64 * 1024]);
}

#[test]
fn test_readers_see_whole_values_during_writes() {
    let base = tempdir().unwrap();
    let upper = tempdir().unwrap();
    fs::write(base.path().join("shared"), "base").unwrap();

    let engine = Arc::new(LayeredFs::new());
    engine.add_layer(base.path(), false, Some("base")).unwrap();
    engine.add_layer(upper.path(), true, Some("upper")).unwrap();

    let writer = {
        let engine = engine.clone();
        thread::spawn(move || {
            for i in 0..50 {
                engine.atomic_write("shared", format!("v{}", i)).unwrap();
                if i % 5 == 0 {
                    engine.delete("shared", true).unwrap();
                }
            }
            engine.atomic_write("shared", "final").unwrap();
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let engine = engine.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    match engine.read("shared") {
                        Ok(s) => assert!(s == "base" || s == "final" || s.starts_with('v'), "{}", s),
                        Err(e) => assert!(e.is_not_found(), "{}", e),
                    }
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for r in readers {
        r.join().unwrap();
    }
    assert_eq!(engine.read("shared").unwrap(), "final");
}

#[test]
fn test_parallel_writers_on_distinct_paths() {
    let upper = tempdir().unwrap();
    let engine = Arc::new(LayeredFs::new());
    engine.add_layer(upper.path(), true, None).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let engine = engine.clone();
            thread::spawn(move || {
                for i in 0..10 {
                    engine.write(format!("out/t{}/f{}", t, i), "x").unwrap();
                    let _ = engine.children("out");
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(engine.children("out").unwrap().len(), 8);
    assert_eq!(engine.find("out", Some(&|e: &Entry| e.is_file())).unwrap().len(), 80);
}
