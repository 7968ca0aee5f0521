//! End-to-end mVRL: stream, label, and message survive the byte boundary.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use millrace::{
    Block, BlockSetup, DType, Error, Label, Runtime, Topology, Value, WorkIo,
};

const IDLE: Duration = Duration::from_millis(150);
const TIMEOUT: Duration = Duration::from_secs(20);

struct PatternSource {
    total: usize,
    sent: usize,
    counter: u8,
}

impl Block for PatternSource {
    fn setup(&mut self, setup: &mut BlockSetup) {
        setup.set_name("PatternSource");
        setup.output("out0", DType::u8(), "");
    }

    fn work(&mut self, io: &mut WorkIo) -> Result<(), Error> {
        if self.sent >= self.total {
            return Ok(());
        }
        let output = io.output(0);
        if self.sent == 0 {
            output.post_label(Label::new("T", Value::Int(7), 5));
            output.post_message(Value::Str("hello".into()));
        }
        let remaining = self.total - self.sent;
        let buffer = output.buffer();
        let n = buffer.len().min(remaining);
        if n == 0 {
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

#[derive(Default)]
struct Capture {
    bytes: usize,
    labels: Vec<(String, u64, Value)>,
    messages: Vec<Value>,
}

struct PatternSink {
    capture: Arc<Mutex<Capture>>,
    received: Arc<AtomicUsize>,
    intact: Arc<AtomicBool>,
    expected: u8,
}

impl Block for PatternSink {
    fn setup(&mut self, setup: &mut BlockSetup) {
        setup.set_name("PatternSink");
        setup.input("in0", DType::u8(), "");
    }

    fn work(&mut self, io: &mut WorkIo) -> Result<(), Error> {
        let input = io.input(0);
        let mut capture = self.capture.lock().unwrap();

        let start = input.total_elements();
        for label in input.labels() {
            let absolute = start + label.index;
            if !capture
                .labels
                .iter()
                .any(|(id, at, _)| *id == label.id && *at == absolute)
            {
                capture.labels.push((label.id.clone(), absolute, label.data.clone()));
            }
        }
        while let Some(message) = input.pop_message() {
            capture.messages.push(message);
        }

        let n = input.elements();
        if n == 0 {
            return Ok(());
        }
        for (offset, byte) in input.buffer()[..n].iter().enumerate() {
            if *byte != self.expected.wrapping_add(offset as u8) {
                self.intact.store(false, Ordering::SeqCst);
            }
        }
        self.expected = self.expected.wrapping_add(n as u8);
        capture.bytes += n;
        input.consume(n)?;
        self.received.fetch_add(n, Ordering::SeqCst);
        Ok(())
    }

    fn as_any(&mut self) -> &mut dyn Any {
        self
    }
}

#[test]
fn stream_labels_and_messages_cross_the_wire() {
    const TOTAL: usize = 100_000;

    let runtime = Runtime::new();
    let capture = Arc::new(Mutex::new(Capture::default()));
    let received = Arc::new(AtomicUsize::new(0));
    let intact = Arc::new(AtomicBool::new(true));

    let source = runtime
        .register(PatternSource {
            total: TOTAL,
            sent: 0,
            counter: 0,
        })
        .unwrap();
    let serializer = runtime.make("/blocks/serializer", &[]).unwrap();
    let deserializer = runtime.make("/blocks/deserializer", &[]).unwrap();
    let sink = runtime
        .register(PatternSink {
            capture: capture.clone(),
            received: received.clone(),
            intact: intact.clone(),
            expected: 0,
        })
        .unwrap();

    let topology = Topology::new(&runtime);
    topology.connect(&source, "out0", &serializer, "0").unwrap();
    topology.connect(&serializer, "0", &deserializer, "0").unwrap();
    topology.connect(&deserializer, "0", &sink, "in0").unwrap();
    topology.commit().unwrap();

    assert!(topology.wait_inactive(IDLE, TIMEOUT));
    assert_eq!(received.load(Ordering::SeqCst), TOTAL);
    assert!(intact.load(Ordering::SeqCst));

    let capture = capture.lock().unwrap();
    assert_eq!(capture.bytes, TOTAL);
    assert_eq!(capture.messages, vec![Value::Str("hello".into())]);
    assert_eq!(capture.labels.len(), 1);
    let (id, at, data) = &capture.labels[0];
    assert_eq!(id, "T");
    assert_eq!(*at, 5);
    assert_eq!(data, &Value::Int(7));
}
