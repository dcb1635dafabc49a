use soundbridge::{PullSource, RingBuffer, RingError, RingPull};

#[test]
fn cumulative_writes_are_all_available() {
    for capacity in [1usize, 7, 64] {
        let mut ring = RingBuffer::new(capacity).expect("ring");
        let mut written = 0;
        let mut chunk = 1;
        while written + chunk <= capacity {
            ring.write(&vec![0.5; chunk]);
            written += chunk;
            assert_eq!(ring.available(), written, "capacity {capacity}");
            chunk += 1;
        }
    }
}

#[test]
fn oversized_write_keeps_newest_samples() {
    for capacity in [1usize, 3, 8, 33] {
        for extra in [0usize, 1, 5, 40] {
            let mut ring = RingBuffer::new(capacity).expect("ring");
            ring.write(&[9.0, 9.0]);
            let samples: Vec<f32> = (0..capacity + extra).map(|i| i as f32).collect();
            ring.write(&samples);
            assert_eq!(ring.available(), capacity);
            assert!(ring.is_full());
            let tail = samples[samples.len() - capacity..].to_vec();
            assert_eq!(ring.read(capacity).expect("read"), tail);
        }
    }
}

#[test]
fn reading_everything_leaves_nothing() {
    let mut ring = RingBuffer::new(10).expect("ring");
    for burst in [3usize, 9, 14, 0, 6] {
        ring.write(&vec![1.0; burst]);
        let available = ring.available();
        ring.read(available).expect("read");
        assert_eq!(ring.available(), 0);
    }
}

#[test]
fn failed_read_leaves_buffer_untouched() {
    let mut ring = RingBuffer::new(8).expect("ring");
    ring.write(&[1.0, 2.0, 3.0]);
    assert!(matches!(
        ring.read(4),
        Err(RingError::Underflow {
            requested: 4,
            available: 3
        })
    ));
    assert_eq!(ring.available(), 3);
    assert_eq!(ring.read(3).expect("read"), vec![1.0, 2.0, 3.0]);
}

#[test]
fn round_trip_preserves_order_across_wrap() {
    let mut ring = RingBuffer::new(6).expect("ring");
    ring.write(&[0.0; 4]);
    ring.read(4).expect("read");

    let sequence = [0.1, -0.2, 0.3, -0.4, 0.5];
    ring.write(&sequence);
    assert_eq!(ring.read(sequence.len()).expect("read"), sequence.to_vec());
}

#[test]
fn capacity_eight_keeps_last_eight_of_ten() {
    let mut ring = RingBuffer::new(8).expect("ring");
    let samples: Vec<f32> = (1..=10).map(|i| i as f32).collect();
    ring.write(&samples);
    assert_eq!(ring.available(), 8);
    assert_eq!(
        ring.read(8).expect("read"),
        vec![3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0]
    );
}

#[test]
fn empty_ring_pull_supplies_one_zero() {
    let ring = RingBuffer::shared(8).expect("ring");
    let mut pull = RingPull::new(ring);
    let mut dest = Vec::new();
    pull.pull(&mut dest);
    assert_eq!(dest, vec![0.0]);
    pull.pull(&mut dest);
    assert_eq!(dest, vec![0.0, 0.0]);
}

#[test]
fn zero_capacity_is_rejected() {
    assert!(RingBuffer::new(0).is_none());
    assert!(RingBuffer::shared(0).is_none());
}
