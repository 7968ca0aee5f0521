//! Scenario tests for pass-through flattening, commit semantics, and the
//! JSON dumps.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use millrace::{
    Block, BlockSetup, DType, DumpMode, Error, Runtime, Topology, Value, WorkIo,
};

const IDLE: Duration = Duration::from_millis(100);
const TIMEOUT: Duration = Duration::from_secs(10);

struct Ping {
    which: &'static str,
    once: bool,
}

impl Ping {
    fn new(which: &'static str) -> Self {
        Self { which, once: false }
    }
}

impl Block for Ping {
    fn setup(&mut self, setup: &mut BlockSetup) {
        setup.set_name(format!("Ping{}", self.which));
        setup.output("out0", DType::empty(), "");
    }

    fn work(&mut self, io: &mut WorkIo) -> Result<(), Error> {
        if self.once {
            return Ok(());
        }
        self.once = true;
        io.output(0).post_message(Value::Int(42));
        Ok(())
    }

    fn as_any(&mut self) -> &mut dyn Any {
        self
    }
}

struct Pong {
    which: &'static str,
    triggered: Arc<AtomicUsize>,
}

impl Pong {
    fn new(which: &'static str, triggered: Arc<AtomicUsize>) -> Self {
        Self { which, triggered }
    }
}

impl Block for Pong {
    fn setup(&mut self, setup: &mut BlockSetup) {
        setup.set_name(format!("Pong{}", self.which));
        setup.input("in0", DType::empty(), "");
    }

    fn work(&mut self, io: &mut WorkIo) -> Result<(), Error> {
        while io.input(0).pop_message().is_some() {
            self.triggered.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn as_any(&mut self) -> &mut dyn Any {
        self
    }
}

fn blocks_len(dump: &serde_json::Value) -> usize {
    dump["blocks"].as_object().map(|m| m.len()).unwrap_or(0)
}

fn connections_len(dump: &serde_json::Value) -> usize {
    dump["connections"].as_array().map(|a| a.len()).unwrap_or(0)
}

fn connections_have(
    dump: &serde_json::Value,
    src_id: &str,
    src_name: &str,
    dst_id: &str,
    dst_name: &str,
) -> bool {
    dump["connections"]
        .as_array()
        .map(|conns| {
            conns.iter().any(|c| {
                c["srcId"] == src_id
                    && c["srcName"] == src_name
                    && c["dstId"] == dst_id
                    && c["dstName"] == dst_name
            })
        })
        .unwrap_or(false)
}

#[test]
fn simple_passthrough() {
    let runtime = Runtime::new();

    let passer = Topology::new(&runtime);
    passer.set_name("Passer");
    passer.connect(&passer, "passIn", &passer, "passOut").unwrap();

    let triggered = Arc::new(AtomicUsize::new(0));
    let ping = runtime.register(Ping::new("")).unwrap();
    let pong = runtime.register(Pong::new("", triggered.clone())).unwrap();

    let topology = Topology::new(&runtime);
    topology.connect(&ping, "out0", &passer, "passIn").unwrap();
    topology.connect(&passer, "passOut", &pong, "in0").unwrap();
    topology.commit().unwrap();

    assert!(topology.wait_inactive(IDLE, TIMEOUT));
    assert_eq!(triggered.load(Ordering::SeqCst), 1);

    let top = topology.dump(DumpMode::Top);
    assert_eq!(blocks_len(&top), 3);
    assert_eq!(connections_len(&top), 2);
    assert!(connections_have(
        &top,
        &ping.uid().to_string(),
        "out0",
        &passer.uid().to_string(),
        "passIn",
    ));

    let flat = topology.dump(DumpMode::Flat);
    assert_eq!(blocks_len(&flat), 2);
    assert_eq!(connections_len(&flat), 1);
    assert!(connections_have(
        &flat,
        &ping.uid().to_string(),
        "out0",
        &pong.uid().to_string(),
        "in0",
    ));

    // The rendered view matches the flat view once committed.
    let rendered = topology.dump(DumpMode::Rendered);
    assert_eq!(connections_len(&rendered), 1);
}

#[test]
fn nested_passthrough() {
    let runtime = Runtime::new();

    let passer = Topology::new(&runtime);
    passer.set_name("Passer");
    passer.connect(&passer, "passIn", &passer, "passOut").unwrap();

    let nester = Topology::new(&runtime);
    nester.set_name("Nester");
    nester.connect(&nester, "nestIn", &passer, "passIn").unwrap();
    nester.connect(&passer, "passOut", &nester, "nestOut").unwrap();

    let triggered = Arc::new(AtomicUsize::new(0));
    let ping = runtime.register(Ping::new("")).unwrap();
    let pong = runtime.register(Pong::new("", triggered.clone())).unwrap();

    let topology = Topology::new(&runtime);
    topology.connect(&ping, "out0", &nester, "nestIn").unwrap();
    topology.connect(&nester, "nestOut", &pong, "in0").unwrap();
    topology.commit().unwrap();

    assert!(topology.wait_inactive(IDLE, TIMEOUT));
    assert_eq!(triggered.load(Ordering::SeqCst), 1);

    // The nester appears opaquely in the top view.
    let top = topology.dump(DumpMode::Top);
    assert_eq!(blocks_len(&top), 3);
    assert_eq!(connections_len(&top), 2);
    assert!(top["blocks"][nester.uid().to_string()]["connections"].is_array());

    let flat = topology.dump(DumpMode::Flat);
    assert_eq!(blocks_len(&flat), 2);
    assert!(connections_have(
        &flat,
        &ping.uid().to_string(),
        "out0",
        &pong.uid().to_string(),
        "in0",
    ));
}

#[test]
fn multi_source_through_passthrough() {
    let runtime = Runtime::new();

    let passer = Topology::new(&runtime);
    passer.set_name("Passer");
    passer.connect(&passer, "passIn", &passer, "passOut").unwrap();

    let inner_ping = runtime.register(Ping::new("Inner")).unwrap();

    let nester = Topology::new(&runtime);
    nester.set_name("Nester");
    nester.connect(&nester, "nestIn", &passer, "passIn").unwrap();
    nester.connect(&passer, "passOut", &nester, "nestOut").unwrap();
    nester.connect(&inner_ping, "out0", &passer, "passIn").unwrap();

    let triggered = Arc::new(AtomicUsize::new(0));
    let outer_ping = runtime.register(Ping::new("Outer")).unwrap();
    let pong = runtime.register(Pong::new("", triggered.clone())).unwrap();

    let topology = Topology::new(&runtime);
    topology.connect(&outer_ping, "out0", &nester, "nestIn").unwrap();
    topology.connect(&nester, "nestOut", &pong, "in0").unwrap();
    topology.commit().unwrap();

    assert!(topology.wait_inactive(IDLE, TIMEOUT));
    assert_eq!(triggered.load(Ordering::SeqCst), 2);

    let flat = topology.dump(DumpMode::Flat);
    assert!(connections_have(
        &flat,
        &outer_ping.uid().to_string(),
        "out0",
        &pong.uid().to_string(),
        "in0",
    ));
    assert!(connections_have(
        &flat,
        &inner_ping.uid().to_string(),
        "out0",
        &pong.uid().to_string(),
        "in0",
    ));
}

#[test]
fn shared_passthrough_cross_product() {
    let runtime = Runtime::new();

    let passer = Topology::new(&runtime);
    passer.set_name("Passer");
    passer.connect(&passer, "passIn", &passer, "passOut").unwrap();

    let inner_triggered = Arc::new(AtomicUsize::new(0));
    let inner_ping = runtime.register(Ping::new("Inner")).unwrap();
    let inner_pong = runtime
        .register(Pong::new("Inner", inner_triggered.clone()))
        .unwrap();
    passer.connect(&inner_ping, "out0", &passer, "passIn").unwrap();
    passer.connect(&passer, "passOut", &inner_pong, "in0").unwrap();

    let outer_triggered = Arc::new(AtomicUsize::new(0));
    let outer_ping = runtime.register(Ping::new("Outer")).unwrap();
    let outer_pong = runtime
        .register(Pong::new("Outer", outer_triggered.clone()))
        .unwrap();

    let topology = Topology::new(&runtime);
    topology.connect(&outer_ping, "out0", &passer, "passIn").unwrap();
    topology.connect(&passer, "passOut", &outer_pong, "in0").unwrap();
    topology.commit().unwrap();

    assert!(topology.wait_inactive(IDLE, TIMEOUT));
    // Each pong sees both sources through the shared pipe.
    assert_eq!(inner_triggered.load(Ordering::SeqCst), 2);
    assert_eq!(outer_triggered.load(Ordering::SeqCst), 2);

    let flat = topology.dump(DumpMode::Flat);
    assert_eq!(connections_len(&flat), 4);
    for ping in [&inner_ping, &outer_ping] {
        for pong in [&inner_pong, &outer_pong] {
            assert!(connections_have(
                &flat,
                &ping.uid().to_string(),
                "out0",
                &pong.uid().to_string(),
                "in0",
            ));
        }
    }
}

#[test]
fn flatten_is_idempotent() {
    let runtime = Runtime::new();

    let passer = Topology::new(&runtime);
    passer.set_name("Passer");
    passer.connect(&passer, "passIn", &passer, "passOut").unwrap();

    let triggered = Arc::new(AtomicUsize::new(0));
    let ping = runtime.register(Ping::new("")).unwrap();
    let pong = runtime.register(Pong::new("", triggered)).unwrap();

    let nested = Topology::new(&runtime);
    nested.connect(&ping, "out0", &passer, "passIn").unwrap();
    nested.connect(&passer, "passOut", &pong, "in0").unwrap();

    // A graph declared directly over real blocks flattens to itself.
    let direct = Topology::new(&runtime);
    direct.connect(&ping, "out0", &pong, "in0").unwrap();

    let once = nested.dump(DumpMode::Flat);
    let twice = nested.dump(DumpMode::Flat);
    assert_eq!(once["connections"], twice["connections"]);
    assert_eq!(once["connections"], direct.dump(DumpMode::Flat)["connections"]);
}

#[test]
fn duplicate_flow_rejected() {
    let runtime = Runtime::new();
    let ping = runtime.register(Ping::new("")).unwrap();
    let pong = runtime
        .register(Pong::new("", Arc::new(AtomicUsize::new(0))))
        .unwrap();

    let topology = Topology::new(&runtime);
    topology.connect(&ping, "out0", &pong, "in0").unwrap();
    let error = topology.connect(&ping, "out0", &pong, "in0").unwrap_err();
    assert!(matches!(error, Error::TopologyConnect(_)));
}

#[test]
fn unknown_port_rejected_at_connect() {
    let runtime = Runtime::new();
    let ping = runtime.register(Ping::new("")).unwrap();
    let pong = runtime
        .register(Pong::new("", Arc::new(AtomicUsize::new(0))))
        .unwrap();

    let topology = Topology::new(&runtime);
    let error = topology.connect(&ping, "out7", &pong, "in0").unwrap_err();
    assert!(matches!(error, Error::TopologyConnect(_)));
    let error = topology.connect(&ping, "out0", &pong, "in9").unwrap_err();
    assert!(matches!(error, Error::TopologyConnect(_)));
}

struct CudaSource;

impl Block for CudaSource {
    fn setup(&mut self, setup: &mut BlockSetup) {
        setup.set_name("CudaSource");
        setup.output("out0", DType::u8(), "cuda");
    }

    fn as_any(&mut self) -> &mut dyn Any {
        self
    }
}

struct HostSink;

impl Block for HostSink {
    fn setup(&mut self, setup: &mut BlockSetup) {
        setup.set_name("HostSink");
        setup.input("in0", DType::u8(), "");
    }

    fn input_buffer_manager(
        &mut self,
        _name: &str,
        upstream_domain: &str,
    ) -> Result<Option<Box<dyn millrace::buffer::BufferManager>>, Error> {
        if upstream_domain == "cuda" {
            return Err(Error::Runtime("this sink only reads host memory".into()));
        }
        Ok(None)
    }

    fn as_any(&mut self) -> &mut dyn Any {
        self
    }
}

#[test]
fn domain_mismatch_fails_commit_transactionally() {
    let runtime = Runtime::new();
    let source = runtime.register(CudaSource).unwrap();
    let sink = runtime.register(HostSink).unwrap();

    let topology = Topology::new(&runtime);
    topology.connect(&source, "out0", &sink, "in0").unwrap();

    let error = topology.commit().unwrap_err();
    match &error {
        Error::PortDomain {
            src_domain,
            dst_domain,
            ..
        } => {
            assert_eq!(src_domain, "cuda");
            assert_eq!(dst_domain, "");
        }
        other => panic!("unexpected error: {other}"),
    }

    // Pre-commit state is preserved: nothing activated, nothing rendered.
    assert!(!source.is_active());
    assert!(!sink.is_active());
    assert_eq!(connections_len(&topology.dump(DumpMode::Rendered)), 0);
}

#[test]
fn disconnect_and_recommit_deactivates() {
    let runtime = Runtime::new();
    let triggered = Arc::new(AtomicUsize::new(0));
    let ping = runtime.register(Ping::new("")).unwrap();
    let pong = runtime.register(Pong::new("", triggered)).unwrap();

    let topology = Topology::new(&runtime);
    topology.connect(&ping, "out0", &pong, "in0").unwrap();
    topology.commit().unwrap();
    assert!(topology.wait_inactive(IDLE, TIMEOUT));
    assert!(ping.is_active());
    assert!(pong.is_active());

    topology.disconnect_all();
    topology.commit().unwrap();
    assert!(!ping.is_active());
    assert!(!pong.is_active());
    assert_eq!(connections_len(&topology.dump(DumpMode::Rendered)), 0);
}

#[test]
fn stats_report_message_totals() {
    let runtime = Runtime::new();
    let triggered = Arc::new(AtomicUsize::new(0));
    let ping = runtime.register(Ping::new("")).unwrap();
    let pong = runtime.register(Pong::new("", triggered)).unwrap();

    let topology = Topology::new(&runtime);
    topology.connect(&ping, "out0", &pong, "in0").unwrap();
    topology.commit().unwrap();
    assert!(topology.wait_inactive(IDLE, TIMEOUT));

    let stats = topology.stats();
    let ping_stats = &stats[ping.uid().to_string()];
    assert_eq!(ping_stats["outputs"][0]["totalMessages"], 1);
    assert!(ping_stats["activityIndicator"].as_u64().unwrap_or(0) > 0);
    assert!(ping_stats["lastWorkTime"].as_u64().is_some());

    let pong_stats = &stats[pong.uid().to_string()];
    assert_eq!(pong_stats["inputs"][0]["totalMessages"], 1);
}

#[test]
fn wait_inactive_times_out_while_busy() {
    struct Restless;

    impl Block for Restless {
        fn setup(&mut self, setup: &mut BlockSetup) {
            setup.set_name("Restless");
            setup.output("out0", DType::empty(), "");
        }

        fn work(&mut self, io: &mut WorkIo) -> Result<(), Error> {
            io.output(0).post_message(Value::Unit);
            Ok(())
        }

        fn as_any(&mut self) -> &mut dyn Any {
            self
        }
    }

    let runtime = Runtime::new();
    let triggered = Arc::new(AtomicUsize::new(0));
    let restless = runtime.register(Restless).unwrap();
    let pong = runtime.register(Pong::new("", triggered)).unwrap();

    let topology = Topology::new(&runtime);
    topology.connect(&restless, "out0", &pong, "in0").unwrap();
    topology.commit().unwrap();

    // The source posts a message on every tick; it is never idle.
    assert!(!topology.wait_inactive(Duration::from_millis(200), Duration::from_millis(800)));
}
