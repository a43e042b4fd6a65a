//! Integration tests for the power meter exporter.
//!
//! These tests drive full scans from a parsed configuration through a
//! simulated bus to the rendered exposition and the HTTP endpoint.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::watch;

use powermeter_exporter::registry;
use powermeter_exporter::transport::ReadOutcome;
use powermeter_exporter::{
    ExporterConfig, HttpServer, ReadError, RegisterTransport, Scanner, SharedScanner,
    TransportError,
};

/// Simulated RS-485 bus with a register image per unit.
#[derive(Default)]
struct SimulatedBus {
    units: HashMap<u8, HashMap<u16, u16>>,
    exceptions: HashSet<(u8, u16)>,
    delay: Option<Duration>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    requests: Arc<AtomicUsize>,
    completed: Arc<AtomicUsize>,
}

impl SimulatedBus {
    fn set(&mut self, unit: u8, address: u16, words: &[u16]) {
        let image = self.units.entry(unit).or_default();
        for (i, word) in words.iter().enumerate() {
            image.insert(address + i as u16, *word);
        }
    }

    /// A Finder 7M reporting 50 Hz, 230.1 V, -1500 W and 1234.5 Wh.
    fn add_finder(&mut self, unit: u8) {
        self.set(unit, 105, &[0xFE00, 5000]);
        self.set(unit, 107, &[0xFF00, 2301]);
        self.set(unit, 140, &[0x00FF, 0xFA24]);
        self.set(unit, 462, &[0x0000, 12345, 0x0000, 20, 0x0000, 0, 0x0000, 7]);
    }

    /// An Eastron SDM reporting 230.1 V, 2000 W, 50 Hz and 1.5 kWh.
    fn add_eastron(&mut self, unit: u8) {
        self.set(unit, 0, &[0x4366, 0x199A]);
        self.set(unit, 6, &[0x3FA0, 0x0000]);
        self.set(unit, 12, &[0x44FA, 0x0000]);
        self.set(unit, 70, &[0x4248, 0x0000, 0x3FC0, 0x0000]);
        self.set(unit, 74, &[0, 0, 0, 0, 0, 0]);
    }
}

impl RegisterTransport for SimulatedBus {
    async fn read_input_registers(
        &mut self,
        unit: u8,
        address: u16,
        count: u16,
    ) -> Result<ReadOutcome, TransportError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);

        let Some(image) = self.units.get(&unit) else {
            return Err(TransportError::Timeout { unit, attempts: 4 });
        };

        let range = address..address + count;
        if range.clone().any(|a| self.exceptions.contains(&(unit, a))) {
            return Ok(Err(ReadError::Exception("IllegalDataAddress".to_string())));
        }

        Ok(Ok(range
            .map(|a| image.get(&a).copied().unwrap_or(0))
            .collect()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

const CONFIG: &str = r#"{
    modbus: { connection: { type: "tcp", host: "127.0.0.1" } },
    meters: [
        { address: 1, type: "finder" },
        { address: 2, type: "finder" },
        { address: 3, type: "eastron", enable: ["current"] },
    ],
}"#;

fn scanner_for(config: &str, bus: SimulatedBus) -> SharedScanner<SimulatedBus> {
    let config = ExporterConfig::parse(config).unwrap();
    let meters = registry::resolve(&config).unwrap();
    Arc::new(Scanner::new(bus, meters, config.server.prefix))
}

/// Exposition body without the timing lines, which vary between scans.
fn samples(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|l| !l.starts_with('#') && !l.contains("meas_time"))
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn test_full_scan_with_unresponsive_meter() {
    let mut bus = SimulatedBus::default();
    bus.add_finder(1);
    bus.add_eastron(3);
    let scanner = scanner_for(CONFIG, bus);

    let output = scanner.scrape().await;

    assert_eq!(
        samples(&output),
        vec![
            "powermeter_frequency{address=\"001\"} 50",
            "powermeter_voltage{address=\"001\"} 230.1",
            "powermeter_power_active{address=\"001\"} -1500",
            "powermeter_counter_n1{address=\"001\"} 1234.5",
            "powermeter_counter_n2{address=\"001\"} 2",
            "powermeter_counter_n3{address=\"001\"} 0",
            "powermeter_counter_n4{address=\"001\"} 0.7",
            "powermeter_voltage{address=\"003\"} 230.1",
            "powermeter_current{address=\"003\"} 1.25",
            "powermeter_power_active{address=\"003\"} 2000",
            "powermeter_frequency{address=\"003\"} 50",
            "powermeter_counter_n1{address=\"003\"} 1500",
            "powermeter_counter_n2{address=\"003\"} 0",
            "powermeter_counter_n3{address=\"003\"} 0",
            "powermeter_counter_n4{address=\"003\"} 0",
        ]
    );

    // Unit 2 never answered: no samples and no timing line
    assert!(!output.contains("address=\"002\""));
    assert!(output.contains("powermeter_meas_time{address=\"001\"} "));
    assert!(output.contains("powermeter_meas_time{address=\"003\"} "));

    let last = output.lines().last().unwrap();
    assert!(last.starts_with("powermeter_meas_time "));
}

#[tokio::test]
async fn test_device_exception_drops_only_covered_metrics() {
    let mut bus = SimulatedBus::default();
    bus.add_finder(1);
    bus.add_eastron(3);
    bus.exceptions.insert((1, 140));
    let scanner = scanner_for(CONFIG, bus);

    let output = scanner.scrape().await;

    assert!(!output.contains("powermeter_power_active{address=\"001\"}"));
    assert!(output.contains("powermeter_voltage{address=\"001\"} 230.1\n"));
    assert!(output.contains("powermeter_counter_n1{address=\"001\"} 1234.5\n"));
    assert!(output.contains("powermeter_power_active{address=\"003\"} 2000\n"));
}

#[tokio::test]
async fn test_preamble_present_without_responsive_meters() {
    let scanner = scanner_for(CONFIG, SimulatedBus::default());

    let output = scanner.scrape().await;

    assert!(samples(&output).is_empty());
    assert_eq!(output.lines().filter(|l| l.starts_with("# HELP")).count(), 11);
    assert_eq!(output.lines().filter(|l| l.starts_with("# TYPE")).count(), 11);
    assert!(output.contains("# TYPE powermeter_counter_n4 counter\n"));
}

#[tokio::test]
async fn test_repeated_scans_are_identical() {
    let mut bus = SimulatedBus::default();
    bus.add_finder(1);
    bus.add_finder(2);
    bus.add_eastron(3);
    let scanner = scanner_for(CONFIG, bus);

    let first = scanner.scrape().await;
    let second = scanner.scrape().await;

    assert_eq!(samples(&first), samples(&second));

    let strip = |s: &str| -> Vec<String> {
        s.lines()
            .map(|l| match l.rsplit_once(' ') {
                Some((name, _)) if l.contains("meas_time") && !l.starts_with('#') => {
                    name.to_string()
                }
                _ => l.to_string(),
            })
            .collect()
    };
    assert_eq!(strip(&first), strip(&second));
}

#[tokio::test]
async fn test_custom_device_type_and_prefix() {
    let config = r#"{
        modbus: { connection: { type: "rtu", port: "/dev/ttyUSB0" } },
        server: { prefix: "site" },
        device_types: {
            heatpump: {
                registers: [
                    { address: 0, words: 1, decoder: "t2", metric: "power_active", scale: 10 },
                    { address: 1, words: 2, decoder: "t3", metric: "counter_n1", unit: "Wh", scale: 0.1 },
                ],
            },
        },
        meters: [ { address: 42, type: "heatpump" } ],
    }"#;

    let mut bus = SimulatedBus::default();
    bus.set(42, 0, &[0xFFF6, 0x0000, 12345]);
    let scanner = scanner_for(config, bus);

    let output = scanner.scrape().await;

    assert_eq!(
        samples(&output),
        vec![
            "site_power_active{address=\"042\"} -100",
            "site_counter_n1{address=\"042\"} 1234.5",
        ]
    );
}

#[tokio::test]
async fn test_concurrent_scrapes_never_interleave() {
    let mut bus = SimulatedBus {
        delay: Some(Duration::from_millis(2)),
        ..Default::default()
    };
    bus.add_finder(1);
    bus.add_eastron(3);
    let max_in_flight = bus.max_in_flight.clone();
    let requests = bus.requests.clone();
    let scanner = scanner_for(CONFIG, bus);

    let (a, b, c) = tokio::join!(scanner.scrape(), scanner.scrape(), scanner.scrape());

    assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(samples(&a), samples(&b));
    assert_eq!(samples(&b), samples(&c));
    // Finder: 3 blocks per responsive meter, 1 failed request for unit 2,
    // Eastron: 3 blocks plus the current register
    assert_eq!(requests.load(Ordering::SeqCst), 3 * (3 + 1 + 4));
}

#[tokio::test]
async fn test_http_endpoint_over_socket() {
    let mut bus = SimulatedBus::default();
    bus.add_finder(1);
    let scanner = scanner_for(CONFIG, bus);

    let listen_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let server = HttpServer::new(scanner, listen_addr, "/metrics".to_string(), false);
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { server.serve(listener, shutdown_rx).await });

    let client = reqwest::Client::new();

    let response = client
        .get(format!("http://{}/metrics", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        "text/plain; version=0.0.4; charset=utf-8"
    );
    let body = response.text().await.unwrap();
    assert!(body.contains("powermeter_voltage{address=\"001\"} 230.1\n"));

    let response = client
        .get(format!("http://{}/other", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    assert_eq!(response.text().await.unwrap(), "Not found");
    drop(client);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_scan_completes_after_client_gives_up() {
    const TWO_FINDERS: &str = r#"{
        modbus: { connection: { type: "tcp", host: "127.0.0.1" } },
        meters: [
            { address: 1, type: "finder" },
            { address: 2, type: "finder" },
        ],
    }"#;

    let mut bus = SimulatedBus {
        delay: Some(Duration::from_millis(100)),
        ..Default::default()
    };
    bus.add_finder(1);
    bus.add_finder(2);
    let requests = bus.requests.clone();
    let completed = bus.completed.clone();
    let scanner = scanner_for(TWO_FINDERS, bus);

    let listen_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let server = HttpServer::new(
        scanner.clone(),
        listen_addr,
        "/metrics".to_string(),
        false,
    );
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { server.serve(listener, shutdown_rx).await });

    // Six 100 ms requests, far longer than the client is willing to wait
    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(250))
        .build()
        .unwrap();
    let result = client.get(format!("http://{}/metrics", addr)).send().await;
    assert!(result.is_err());
    drop(client);

    // Closing waits for the scan holding the transport
    tokio::time::timeout(Duration::from_secs(5), scanner.close())
        .await
        .unwrap();

    assert_eq!(requests.load(Ordering::SeqCst), 2 * 3);
    assert_eq!(completed.load(Ordering::SeqCst), 2 * 3);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[test]
fn test_startup_rejects_bad_meters() {
    let unknown = r#"{
        modbus: { connection: { type: "tcp", host: "gw" } },
        meters: [ { address: 1, type: "sdm630" } ],
    }"#;
    let config = ExporterConfig::parse(unknown).unwrap();
    assert!(registry::resolve(&config).is_err());

    let duplicate = r#"{
        modbus: { connection: { type: "tcp", host: "gw" } },
        meters: [ { address: 5, type: "finder" }, { address: 5, type: "eastron" } ],
    }"#;
    let config = ExporterConfig::parse(duplicate).unwrap();
    assert!(registry::resolve(&config).is_err());

    let out_of_range = r#"{
        modbus: { connection: { type: "tcp", host: "gw" } },
        meters: [ { address: 248, type: "finder" } ],
    }"#;
    let config = ExporterConfig::parse(out_of_range).unwrap();
    assert!(registry::resolve(&config).is_err());
}

#[test]
fn test_shipped_config_is_valid() {
    let config = ExporterConfig::parse(include_str!("../powermeter.json5")).unwrap();
    let meters = registry::resolve(&config).unwrap();

    assert_eq!(meters.len(), 3);
    assert_eq!(config.server.listen, "0.0.0.0:9100");
    assert!(config.device_types.contains_key("sdm120_int"));
}
