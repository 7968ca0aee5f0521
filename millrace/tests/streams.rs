//! Stream-path tests: mass conservation, back-pressure, the circular
//! sliding window, and label propagation.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use millrace::{
    Block, BlockSetup, DType, Error, Label, Runtime, Topology, Value, WorkIo,
};

const IDLE: Duration = Duration::from_millis(150);
const TIMEOUT: Duration = Duration::from_secs(20);

/// Emits `total` bytes of a wrapping counter pattern, with an optional
/// label near the head of the stream.
struct ByteSource {
    total: usize,
    sent: usize,
    counter: u8,
    domain: &'static str,
    label: bool,
}

impl ByteSource {
    fn new(total: usize, domain: &'static str, label: bool) -> Self {
        Self {
            total,
            sent: 0,
            counter: 0,
            domain,
            label,
        }
    }
}

impl Block for ByteSource {
    fn setup(&mut self, setup: &mut BlockSetup) {
        setup.set_name("ByteSource");
        setup.output("out0", DType::u8(), self.domain);
    }

    fn work(&mut self, io: &mut WorkIo) -> Result<(), Error> {
        if self.sent >= self.total {
            return Ok(());
        }
        let output = io.output(0);
        if self.label && self.sent == 0 {
            output.post_label(Label::new("T", Value::Int(7), 5));
        }
        let remaining = self.total - self.sent;
        let buffer = output.buffer();
        let n = buffer.len().min(remaining);
        if n == 0 {
            // Pool exhausted; a downstream consume re-activates us.
            return Ok(());
        }
        for byte in buffer[..n].iter_mut() {
            *byte = self.counter;
            self.counter = self.counter.wrapping_add(1);
        }
        output.produce(n)?;
        self.sent += n;
        Ok(())
    }

    fn as_any(&mut self) -> &mut dyn Any {
        self
    }
}

/// Consumes the counter pattern, verifying continuity, optionally through
/// a sliding window of `reserve` bytes in `step`-byte strides.
struct ByteSink {
    received: Arc<AtomicUsize>,
    intact: Arc<AtomicBool>,
    labels: Arc<Mutex<Vec<(String, u64)>>>,
    expected: u8,
    reserve: usize,
    step: usize,
}

impl ByteSink {
    fn new(
        received: Arc<AtomicUsize>,
        intact: Arc<AtomicBool>,
        labels: Arc<Mutex<Vec<(String, u64)>>>,
    ) -> Self {
        Self {
            received,
            intact,
            labels,
            expected: 0,
            reserve: 0,
            step: 0,
        }
    }

    fn windowed(self, reserve: usize, step: usize) -> Self {
        Self {
            reserve,
            step,
            ..self
        }
    }
}

impl Block for ByteSink {
    fn setup(&mut self, setup: &mut BlockSetup) {
        setup.set_name("ByteSink");
        setup.input("in0", DType::u8(), "");
    }

    fn work(&mut self, io: &mut WorkIo) -> Result<(), Error> {
        let input = io.input(0);
        if self.reserve > 0 {
            input.set_reserve(self.reserve);
        }

        let start = input.total_elements();
        for label in input.labels() {
            let absolute = start + label.index;
            let mut labels = self.labels.lock().unwrap();
            if !labels.iter().any(|(id, at)| *id == label.id && *at == absolute) {
                labels.push((label.id.clone(), absolute));
            }
        }

        let available = input.elements();
        let n = if self.step > 0 {
            if available < self.reserve.max(self.step) {
                return Ok(());
            }
            self.step
        } else {
            available
        };
        for (offset, byte) in input.buffer()[..n].iter().enumerate() {
            if *byte != self.expected.wrapping_add(offset as u8) {
                self.intact.store(false, Ordering::SeqCst);
            }
        }
        self.expected = self.expected.wrapping_add(n as u8);
        input.consume(n)?;
        self.received.fetch_add(n, Ordering::SeqCst);
        Ok(())
    }

    fn as_any(&mut self) -> &mut dyn Any {
        self
    }
}

#[test]
fn mass_conservation_under_back_pressure() {
    // One million bytes through a 256 KiB slab pool forces the producer
    // through the back-pressure path repeatedly.
    const TOTAL: usize = 1_000_000;

    let runtime = Runtime::new();
    let received = Arc::new(AtomicUsize::new(0));
    let intact = Arc::new(AtomicBool::new(true));
    let labels = Arc::new(Mutex::new(Vec::new()));

    let source = runtime.register(ByteSource::new(TOTAL, "", false)).unwrap();
    let sink = runtime
        .register(ByteSink::new(received.clone(), intact.clone(), labels))
        .unwrap();

    let topology = Topology::new(&runtime);
    topology.connect(&source, "out0", &sink, "in0").unwrap();
    topology.commit().unwrap();

    assert!(topology.wait_inactive(IDLE, TIMEOUT));
    assert_eq!(received.load(Ordering::SeqCst), TOTAL);
    assert!(intact.load(Ordering::SeqCst));

    // Produced equals consumed at quiescence, per the work stats.
    let stats = topology.stats();
    let produced = stats[source.uid().to_string()]["outputs"][0]["totalBytes"]
        .as_u64()
        .unwrap_or(0);
    let consumed = stats[sink.uid().to_string()]["inputs"][0]["totalBytes"]
        .as_u64()
        .unwrap_or(0);
    assert_eq!(produced, TOTAL as u64);
    assert_eq!(produced, consumed);
}

#[test]
fn circular_manager_preserves_the_sliding_window() {
    // 200k bytes through a 64 KiB ring wraps several times; the sink
    // walks a 64-byte window in 32-byte strides and verifies that the
    // counter pattern never tears at a wrap.
    const TOTAL: usize = 200_000;

    let runtime = Runtime::new();
    let received = Arc::new(AtomicUsize::new(0));
    let intact = Arc::new(AtomicBool::new(true));
    let labels = Arc::new(Mutex::new(Vec::new()));

    let source = runtime
        .register(ByteSource::new(TOTAL, "circular", false))
        .unwrap();
    let sink = runtime
        .register(ByteSink::new(received.clone(), intact.clone(), labels).windowed(64, 32))
        .unwrap();

    let topology = Topology::new(&runtime);
    topology.connect(&source, "out0", &sink, "in0").unwrap();
    topology.commit().unwrap();

    assert!(topology.wait_inactive(IDLE, TIMEOUT));
    // The final 32 bytes can never fill the 64-byte window.
    assert_eq!(received.load(Ordering::SeqCst), TOTAL - 32);
    assert!(intact.load(Ordering::SeqCst));
}

/// Copies in0 to out0; the default policy forwards its labels.
struct Passthrough;

impl Block for Passthrough {
    fn setup(&mut self, setup: &mut BlockSetup) {
        setup.set_name("Passthrough");
        setup.input("in0", DType::u8(), "");
        setup.output("out0", DType::u8(), "");
    }

    fn work(&mut self, io: &mut WorkIo) -> Result<(), Error> {
        let (inputs, outputs) = io.split();
        let input = &mut inputs[0];
        let output = &mut outputs[0];
        let n = input.elements().min(output.buffer().len());
        if n == 0 {
            return Ok(());
        }
        let visible = input.buffer()[..n].to_vec();
        output.buffer()[..n].copy_from_slice(&visible);
        output.produce(n)?;
        input.consume(n)?;
        Ok(())
    }

    fn as_any(&mut self) -> &mut dyn Any {
        self
    }
}

#[test]
fn labels_propagate_through_a_block() {
    const TOTAL: usize = 10_000;

    let runtime = Runtime::new();
    let received = Arc::new(AtomicUsize::new(0));
    let intact = Arc::new(AtomicBool::new(true));
    let labels = Arc::new(Mutex::new(Vec::new()));

    let source = runtime.register(ByteSource::new(TOTAL, "", true)).unwrap();
    let copy = runtime.register(Passthrough).unwrap();
    let sink = runtime
        .register(ByteSink::new(received.clone(), intact.clone(), labels.clone()))
        .unwrap();

    let topology = Topology::new(&runtime);
    topology.connect(&source, "out0", &copy, "in0").unwrap();
    topology.connect(&copy, "out0", &sink, "in0").unwrap();
    topology.commit().unwrap();

    assert!(topology.wait_inactive(IDLE, TIMEOUT));
    assert_eq!(received.load(Ordering::SeqCst), TOTAL);
    assert!(intact.load(Ordering::SeqCst));

    // The label posted at absolute index 5 crossed the copy unchanged.
    let labels = labels.lock().unwrap();
    assert_eq!(labels.as_slice(), &[("T".to_owned(), 5u64)]);
}

#[test]
fn stream_multi_drive_is_rejected() {
    let runtime = Runtime::new();
    let received = Arc::new(AtomicUsize::new(0));
    let intact = Arc::new(AtomicBool::new(true));
    let labels = Arc::new(Mutex::new(Vec::new()));

    let first = runtime.register(ByteSource::new(16, "", false)).unwrap();
    let second = runtime.register(ByteSource::new(16, "", false)).unwrap();
    let sink = runtime
        .register(ByteSink::new(received, intact, labels))
        .unwrap();

    let topology = Topology::new(&runtime);
    topology.connect(&first, "out0", &sink, "in0").unwrap();
    topology.connect(&second, "out0", &sink, "in0").unwrap();

    let error = topology.commit().unwrap_err();
    assert!(matches!(error, Error::TopologyConnect(_)));
    assert!(!first.is_active());
    assert!(!sink.is_active());
}
