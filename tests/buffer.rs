use rand::prelude::*;

use evio::Buffer;

mod util;

/// Whatever interleaving of appends and consumes, the readable bytes are
/// always the concatenation of everything appended minus everything
/// consumed.
#[test]
fn random_append_consume_matches_model() {
    util::init();
    let mut rng = rand::rng();

    for _ in 0..50 {
        let mut buffer = Buffer::new();
        let mut model: Vec<u8> = Vec::new();

        for _ in 0..400 {
            if rng.random_bool(0.6) {
                let len = rng.random_range(1..2000);
                let chunk: Vec<u8> = (0..len).map(|_| rng.random()).collect();
                buffer.append(&chunk);
                model.extend_from_slice(&chunk);
            } else if !model.is_empty() {
                let n = rng.random_range(0..=model.len().min(buffer.readable_bytes()));
                buffer.consume(n);
                model.drain(..n);
            }
            assert_eq!(buffer.peek(), &model[..]);
            assert_eq!(buffer.readable_bytes(), model.len());
        }
    }
}

#[test]
fn prepend_space_survives_append_consume_cycles() {
    util::init();
    let mut buffer = Buffer::new();
    assert_eq!(buffer.prependable_bytes(), 8);

    buffer.append(b"abcdef");
    buffer.prepend(&[0, 6]);
    assert_eq!(buffer.prependable_bytes(), 6);
    assert_eq!(buffer.peek(), b"\x00\x06abcdef");

    buffer.consume_all();
    assert_eq!(buffer.prependable_bytes(), 8);

    // Consumed bytes flow back into prependable space.
    buffer.append(b"0123456789");
    buffer.consume(4);
    assert_eq!(buffer.prependable_bytes(), 12);
    buffer.prepend(b"xy");
    assert_eq!(buffer.take_all(), b"xy456789");
}

#[test]
fn take_returns_front_bytes() {
    util::init();
    let mut buffer = Buffer::new();
    buffer.append(b"one two three");
    assert_eq!(buffer.take(4), b"one ");
    assert_eq!(buffer.take(4), b"two ");
    assert_eq!(buffer.take_all(), b"three");
    assert!(buffer.is_empty());
}
