//! Client and server driving real udp sessions through the control channel.

use std::thread;

use fabtest::config::TestOptions;
use fabtest::control::{run_client, serve_session, ControlChannel, ControlListener, ResultTally};
use fabtest::provider::udp::UdpProvider;
use fabtest::provider::Registry;
use fabtest::runner::FabricTestRunner;
use fabtest::series::TestSeries;

const SERIES: &str = r#"[
    {
        "prov_name": "udp",
        "class_function": ["send", "inject", "rma"],
        "rma_op": ["write", "writedata", "read"],
        "cq_wait": ["spin", "sread", "fd"],
        "transfer_size": [48],
        "iterations": 20,
        "verify_data": true
    },
    {
        "prov_name": "udp",
        "test_type": ["bandwidth"],
        "comp_type": ["counter"],
        "caps": [["tagged"]],
        "mode": [["msg_prefix"]],
        "transfer_size": [2048],
        "iterations": 150,
        "verify_data": true
    }
]"#;

fn listen() -> (ControlListener, String) {
    let listener = ControlListener::bind(Some("127.0.0.1"), "0").unwrap();
    let port = listener.local_port().unwrap().to_string();
    (listener, port)
}

#[test]
fn passing_series_is_tallied_on_both_sides() {
    let (listener, mgmt_port) = listen();
    let data_port = portpicker::pick_unused_port().expect("no free port").to_string();

    let server = thread::spawn(move || {
        let mut channel = listener.accept().unwrap();
        let mut runner = FabricTestRunner::new(UdpProvider, TestOptions::default().with_warmup(2));
        let mut tally = ResultTally::default();
        serve_session(&mut channel, &mut runner, &mut tally).unwrap();
        tally
    });

    let mut series: TestSeries = SERIES.parse().unwrap();
    series.set_destination("127.0.0.1", &data_port);
    let cases = series.range(0, 0);
    assert_eq!(cases.len(), 15 + 1);

    let mut runner = FabricTestRunner::new(Registry::default(), TestOptions::default().with_warmup(2));
    let mut channel = ControlChannel::connect("127.0.0.1", &mgmt_port).unwrap();
    let mut tally = ResultTally::default();
    run_client(&mut channel, &mut runner, &cases, &mut tally).unwrap();
    channel.shutdown();
    let server_tally = server.join().unwrap();

    assert_eq!(tally, ResultTally { success: 16, ..Default::default() }, "{}", tally);
    assert_eq!(server_tally, tally);
    let last = runner.last_stats().unwrap();
    assert_eq!(last.iterations, 150);
    assert_eq!(last.transfer_size, 2048);
}

#[test]
fn out_of_range_inject_counts_as_no_data() {
    let (listener, mgmt_port) = listen();
    let data_port = portpicker::pick_unused_port().expect("no free port").to_string();
    let server = thread::spawn(move || {
        let mut channel = listener.accept().unwrap();
        let mut runner = FabricTestRunner::new(UdpProvider, TestOptions::default());
        let mut tally = ResultTally::default();
        serve_session(&mut channel, &mut runner, &mut tally).unwrap();
        tally
    });

    let text = r#"{"prov_name": "udp", "class_function": ["inject"], "transfer_size": [4096], "iterations": 1}"#;
    let mut series: TestSeries = text.parse().unwrap();
    series.set_destination("127.0.0.1", &data_port);

    let mut runner = FabricTestRunner::new(UdpProvider, TestOptions::default());
    let mut channel = ControlChannel::connect("127.0.0.1", &mgmt_port).unwrap();
    let mut tally = ResultTally::default();
    run_client(&mut channel, &mut runner, series.tests(), &mut tally).unwrap();
    channel.shutdown();

    assert_eq!(tally.no_data, 1);
    assert_eq!(server.join().unwrap().no_data, 1);
}

#[test]
fn clean_disconnect_ends_the_server_loop() {
    let (listener, mgmt_port) = listen();
    let server = thread::spawn(move || {
        let mut channel = listener.accept().unwrap();
        let mut runner = FabricTestRunner::new(UdpProvider, TestOptions::default());
        let mut tally = ResultTally::default();
        let result = serve_session(&mut channel, &mut runner, &mut tally);
        (result.is_ok(), tally)
    });
    let channel = ControlChannel::connect("127.0.0.1", &mgmt_port).unwrap();
    drop(channel);
    let (ok, tally) = server.join().unwrap();
    assert!(ok);
    assert_eq!(tally.total(), 0);
}
