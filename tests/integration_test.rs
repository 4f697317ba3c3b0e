use devscript::channel::{Channel, MockChannel, MockHandle};
use devscript::protocol::crc::crc16_modbus;
use devscript::{Executor, RunEvent, RunOutcome, Value, parse_str};
use std::fs;
use std::process::Command;
use std::sync::{Arc, Mutex};

fn mock(name: &str) -> (String, Box<dyn Channel>, MockHandle) {
    let (channel, handle) = MockChannel::new(name);
    (name.to_string(), Box::new(channel), handle)
}

fn logs(executor: &mut Executor) -> Arc<Mutex<Vec<String>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    executor.on_event(move |event| {
        if let RunEvent::Log { message } = event {
            sink.lock().unwrap().push(message.clone());
        }
    });
    seen
}

#[tokio::test]
async fn test_modem_and_meter_script() {
    let script = parse_str(
        r#"
vars: {reading: 0}
state_machine:
  initial: probe
  states:
    probe:
      do:
        - action: at_command
          args: {cmd: ATI, channel: modem, save_as: info}
        - action: modbus_read
          args: {channel: meter, function: 3, address: 0x10, quantity: 1, save_as: reg}
        - set: {reading: "$reg.values[0]"}
      goto: check
    check:
      when: "$reading == 42"
      goto: pass
      else_goto: fail
    pass:
      do: [{log: "modem ${info.lines[0]} reads $reading"}]
    fail:
      do: [{log: "bad reading $reading"}]
"#,
    )
    .unwrap();

    let (modem_name, modem, modem_handle) = mock("modem");
    modem_handle.respond_with(|_| Some(b"ATI\r\nQuectel EC21\r\n\r\nOK\r\n".to_vec()));

    let (meter_name, meter, meter_handle) = mock("meter");
    meter_handle.respond_with(|request| {
        assert_eq!(&request[..6], &[0x01, 0x03, 0x00, 0x10, 0x00, 0x01]);
        let mut reply = vec![0x01, 0x03, 0x02, 0x00, 42];
        reply.extend(crc16_modbus(&reply).to_le_bytes());
        Some(reply)
    });

    let mut executor = Executor::with_channels(script, vec![(modem_name, modem), (meter_name, meter)]);
    let seen = logs(&mut executor);

    let outcome = executor.run().await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed { state: "pass".into() });
    assert_eq!(*seen.lock().unwrap(), ["modem Quectel EC21 reads 42"]);
    assert_eq!(modem_handle.written(), b"ATI\r\n");
    assert_eq!(meter_handle.write_count(), 1);
}

#[tokio::test]
async fn test_xmodem_block_loop_resends_on_nak() {
    let dir = tempfile::tempdir().unwrap();
    let firmware = dir.path().join("fw.bin");
    fs::write(&firmware, vec![0x5A; 300]).unwrap();

    let script = parse_str(
        &r#"
vars: {block: 1, file_path: "FIRMWARE"}
state_machine:
  initial: send
  states:
    send:
      do:
        - action: send_xmodem_block
          args: {block: "$block"}
      on_event: {"\x06": acked, "\x15": send}
      timeout: 1000
      on_timeout: failed
    acked:
      do: [{set: {block: "$block + 1"}}]
      goto: next
    next:
      when: "$block <= $file_block_count"
      goto: send
      else_goto: finish
    finish:
      do: [{action: send_eot}]
    failed: ~
"#
        .replace("FIRMWARE", &firmware.to_string_lossy()),
    )
    .unwrap();

    let (name, channel, handle) = mock("dut");
    let mut replies = vec![0x15u8].into_iter();
    handle.respond_with(move |_| Some(vec![replies.next().unwrap_or(0x06)]));

    let mut executor = Executor::with_channels(script, vec![(name, channel)]);
    let outcome = executor.run().await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed { state: "finish".into() });

    let writes = handle.writes();
    let blocks: Vec<u8> = writes[..4].iter().map(|w| w[1]).collect();
    assert_eq!(blocks, [1, 1, 2, 3]);
    assert!(writes[..4].iter().all(|w| w.len() == 133));
    assert_eq!(writes[4], [0x04]);
    assert_eq!(executor.vars()["file_block_count"], Value::Int(3));
    assert_eq!(executor.vars()["last_sent_block"], Value::Int(3));
}

#[tokio::test]
async fn test_frame_exchange() {
    let dir = tempfile::tempdir().unwrap();
    let schema = dir.path().join("sensor.yaml");
    fs::write(
        &schema,
        r#"
frames:
  read_temp:
    header: "AA 55"
    crc: crc16_modbus
    fields:
      - {type: u8, const: 0x01}
      - {name: sensor, type: u8}
  temp:
    header: "AA 55"
    crc: crc16_modbus
    fields:
      - {type: u8, const: 0x81}
      - {name: sensor, type: u8}
      - {name: centi, type: u16}
"#,
    )
    .unwrap();

    let script = parse_str(
        &r#"
vars: {sensor: 2}
state_machine:
  initial: ask
  states:
    ask:
      do:
        - action: send_frame
          args: {schema: "SCHEMA", frame: read_temp, values: {sensor: "$sensor"}}
        - action: expect_frame
          args: {schema: "SCHEMA", frame: temp, timeout: 500, save_as: reply}
        - set: {celsius: "$reply.centi / 100"}
"#
        .replace("SCHEMA", &schema.to_string_lossy()),
    )
    .unwrap();

    let (name, channel, handle) = mock("bus");
    handle.respond_with(|request| {
        let sensor = request[3];
        let body = [0x81, sensor, 0x09, 0x2E];
        let mut reply = vec![0xAA, 0x55];
        reply.extend_from_slice(&body);
        reply.extend(crc16_modbus(&body).to_le_bytes());
        Some(reply)
    });

    let mut executor = Executor::with_channels(script, vec![(name, channel)]);
    executor.run().await.unwrap();

    let vars = executor.vars();
    assert_eq!(vars["reply"].as_map().unwrap()["sensor"], Value::Int(2));
    assert_eq!(vars["celsius"], Value::Float(23.5));
    assert_eq!(vars["last_frame_tx"].as_map().unwrap()["frame"], Value::from("read_temp"));
}

#[tokio::test]
async fn test_recorded_scan_with_list_actions() {
    let dir = tempfile::tempdir().unwrap();
    let script = parse_str(
        &r#"
vars:
  sensors: [{id: 1, ok: true}, {id: 2, ok: false}, {id: 3, ok: true}]
state_machine:
  initial: scan
  states:
    scan:
      do:
        - action: record_start
          args: {dir: "RUNS", name: scan}
        - action: list_filter
          args: {src: sensors, where: "item.ok", dst: healthy}
        - action: list_map
          args: {src: "$healthy", expr: "item.id * 10", out: addresses}
        - if:
            when: "$addresses[0] == 10"
            do: [{log: "polling $addresses"}]
            otherwise: [{log: "nothing to poll"}]
        - action: record_stop
"#
        .replace("RUNS", &dir.path().to_string_lossy()),
    )
    .unwrap();

    let mut executor = Executor::with_channels(script, Vec::new());
    let seen = logs(&mut executor);
    let outcome = executor.run().await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed { state: "scan".into() });
    assert_eq!(*seen.lock().unwrap(), ["polling [10, 30]"]);

    let root = executor.vars()["record_dir"].as_str().unwrap().to_string();
    let events = fs::read_to_string(std::path::Path::new(&root).join("events.log")).unwrap();
    assert!(events.contains("LOG polling [10, 30]"), "{events}");
    let vars = fs::read_to_string(std::path::Path::new(&root).join("vars.yaml")).unwrap();
    assert!(vars.contains("addresses:"), "{vars}");
}

#[test]
fn test_cli_runs_script_with_queued_event() {
    let dir = tempfile::tempdir().unwrap();
    let script_path = dir.path().join("events.yaml");
    fs::write(
        &script_path,
        r#"
state_machine:
  initial: idle
  states:
    idle:
      on_event: {go: done}
      timeout: 2s
      on_timeout: late
    done:
      do: [{log: "got $event"}]
    late:
      do: [{log: "no event"}]
"#,
    )
    .unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_devscript"))
        .arg("--script")
        .arg(&script_path)
        .arg("--event")
        .arg("go")
        .arg("--log-level")
        .arg("warn")
        .output()
        .expect("Failed to execute devscript");

    assert!(
        output.status.success(),
        "devscript failed with stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("got go"), "stdout: {stdout}");
}

#[test]
fn test_cli_reports_bad_script() {
    let dir = tempfile::tempdir().unwrap();
    let script_path = dir.path().join("broken.yaml");
    fs::write(&script_path, "state_machine:\n  initial: nowhere\n  states: {}\n").unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_devscript"))
        .arg("--script")
        .arg(&script_path)
        .output()
        .expect("Failed to execute devscript");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("nowhere"), "stderr: {stderr}");
}
