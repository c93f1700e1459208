//! Cross-thread exercise of the capture ring: one producer, one consumer,
//! no locks.

use std::sync::Arc;
use std::thread;

use kbc_engine::ByteRing;

#[test]
fn spsc_transfer_preserves_order_across_threads() {
    const COUNT: usize = 10_000;
    let ring = Arc::new(ByteRing::new(64));

    let producer = {
        let ring = ring.clone();
        thread::spawn(move || {
            for i in 0..COUNT {
                let byte = (i % 251) as u8;
                while !ring.push(byte) {
                    std::hint::spin_loop();
                }
            }
        })
    };

    let consumer = {
        let ring = ring.clone();
        thread::spawn(move || {
            let mut got = Vec::with_capacity(COUNT);
            while got.len() < COUNT {
                match ring.try_pop() {
                    Some(byte) => got.push(byte),
                    None => std::hint::spin_loop(),
                }
                assert!(ring.count() <= ring.capacity());
            }
            got
        })
    };

    producer.join().unwrap();
    let got = consumer.join().unwrap();
    for (i, byte) in got.iter().enumerate() {
        assert_eq!(*byte, (i % 251) as u8);
    }
}

#[test]
fn saturated_ring_sheds_load_without_corruption() {
    let ring = ByteRing::new(8);
    let mut accepted = Vec::new();
    for i in 0..100u8 {
        if ring.push(i) {
            accepted.push(i);
        }
        // Drain every third push so the ring oscillates around full.
        if i % 3 == 0 {
            if let Some(byte) = ring.try_pop() {
                assert_eq!(byte, accepted.remove(0));
            }
        }
        assert!(ring.count() <= ring.capacity());
    }
    while let Some(byte) = ring.try_pop() {
        assert_eq!(byte, accepted.remove(0));
    }
    assert!(accepted.is_empty());
}
