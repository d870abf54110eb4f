use adiskd::filter::proto;
use adiskd::filter::runner::{FilterRunner, FnFilter};
use adiskd::search::{RunnerFactory, SearchFactory};
use adiskd::server::{Listener, ServerConfig};
use adiskd::{Object, StopSignal};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{BufReader, BufWriter, Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn pass_all_runners() -> RunnerFactory {
    Arc::new(|_spec: &adiskd::filter::FilterSpec| {
        Ok(Box::new(FnFilter::new(|_: &mut Object| 1)) as Box<dyn FilterRunner>)
    })
}

fn test_config(dir: &Path) -> ServerConfig {
    ServerConfig {
        daemon: false,
        fork_conns: true,
        background: false,
        idle_background: true,
        bind_locally: true,
        not_silent: true,
        auth_token: None,
        obj_dir: dir.to_path_buf(),
        control_port: 0,
        data_port: 0,
    }
}

fn send_command<W: Write>(w: &mut W, command: &str) {
    proto::send_string(w, command).expect("should send");
}

fn expect_ok<R: std::io::BufRead, W: Write>(r: &mut R, w: &mut W) {
    w.flush().expect("should flush");
    let status = proto::get_int(r).expect("should read status");
    assert_eq!(0, status, "command failed with status {status}");
}

/// One object frame off the data socket.
fn read_frame<R: Read>(r: &mut R) -> Option<(bool, Vec<u8>, Vec<u8>)> {
    let complete = match r.read_u8() {
        Ok(byte) => byte != 0,
        Err(_) => return None, // EOF: the search drained out
    };

    let payload_len = r.read_u32::<LittleEndian>().expect("should read") as usize;
    let mut payload = vec![0; payload_len];
    r.read_exact(&mut payload).expect("should read payload");

    let attrs_len = r.read_u32::<LittleEndian>().expect("should read") as usize;
    let mut attrs = vec![0; attrs_len];
    r.read_exact(&mut attrs).expect("should read attrs");

    Some((complete, payload, attrs))
}

/// Full client conversation over real sockets: configure, start, stream
/// results, fetch stats, disconnect.
#[test_log::test]
fn wire_end_to_end_search() {
    let folder = tempfile::tempdir().expect("should create tempdir");
    let dir = folder.path();

    for i in 0..3u8 {
        std::fs::write(dir.join(format!("obj-{i}")), vec![i; 8]).expect("should write");
    }

    let factory = Arc::new(
        SearchFactory::new(dir).with_runner_factory(pass_all_runners()),
    );

    let listener =
        Listener::bind(test_config(dir), factory).expect("should bind ephemeral ports");

    let stop = StopSignal::default();
    let accept_stop = stop.clone();
    let accept_side = Arc::clone(&listener);
    let accept_thread = std::thread::spawn(move || {
        let _ = accept_side.listen(&accept_stop);
    });

    let (control_addr, data_addr) = listener.local_addrs().expect("should resolve");

    let control = TcpStream::connect(control_addr).expect("should connect");
    control
        .set_read_timeout(Some(Duration::from_secs(10)))
        .expect("should set timeout");

    let mut reader = BufReader::new(control.try_clone().expect("should clone"));
    let mut writer = BufWriter::new(control);

    let session = proto::get_int(&mut reader).expect("should read session id");
    assert!(session > 0);

    // starting unconfigured is refused
    send_command(&mut writer, "start");
    writer.flush().expect("should flush");
    assert_ne!(0, proto::get_int(&mut reader).expect("should read status"));

    // one pass-everything filter
    send_command(&mut writer, "set_spec");
    proto::send_int(&mut writer, 1).expect("should send");
    proto::send_string(&mut writer, "pass-all").expect("should send");
    proto::send_string(&mut writer, "/bin/true").expect("should send");
    proto::send_string_array::<_, &str>(&mut writer, &[]).expect("should send");
    proto::send_string_array::<_, &str>(&mut writer, &[]).expect("should send");
    proto::send_int(&mut writer, 1).expect("should send");
    expect_ok(&mut reader, &mut writer);

    send_command(&mut writer, "sgid");
    proto::send_string(&mut writer, "00:00:00:00:00:00:00:01").expect("should send");
    expect_ok(&mut reader, &mut writer);

    // attach the data socket before results start flowing
    let data = TcpStream::connect(data_addr).expect("should connect");
    data.set_read_timeout(Some(Duration::from_secs(10)))
        .expect("should set timeout");

    let mut data_writer = BufWriter::new(data.try_clone().expect("should clone"));
    proto::send_int(&mut data_writer, session).expect("should send");
    data_writer.flush().expect("should flush");

    send_command(&mut writer, "start");
    expect_ok(&mut reader, &mut writer);

    let mut data_reader = BufReader::new(data);
    let mut frames = vec![];

    while let Some(frame) = read_frame(&mut data_reader) {
        frames.push(frame);
    }

    assert_eq!(3, frames.len());
    assert!(frames.iter().all(|(complete, _, _)| *complete));
    assert!(frames.iter().all(|(_, payload, _)| payload.len() == 8));

    // every shipped object carries its name attribute
    assert!(frames.iter().all(|(_, _, attrs)| {
        let set = adiskd::AttributeSet::decode(attrs).expect("should decode");
        set.get("name").is_some()
    }));

    send_command(&mut writer, "get_stats");
    expect_ok(&mut reader, &mut writer);

    let mut counters = vec![];
    for _ in 0..12 {
        counters.push(proto::get_int(&mut reader).expect("should read counter"));
    }

    let obj_passed = *counters.get(3).expect("should exist");
    assert_eq!(3, obj_passed);

    let _flags = proto::get_int(&mut reader).expect("should read flags");
    let _avg_ratio = proto::get_int(&mut reader).expect("should read ratio");
    let _smoothed_ratio = proto::get_int(&mut reader).expect("should read ratio");

    let num_filters = proto::get_int(&mut reader).expect("should read count");
    assert_eq!(1, num_filters);

    let name = proto::get_string(&mut reader).expect("should read name");
    assert_eq!("pass-all", name);
    let processed = proto::get_int(&mut reader).expect("should read");
    assert_eq!(3, processed);
    let _dropped = proto::get_int(&mut reader).expect("should read");
    let _avg_ns = proto::get_int(&mut reader).expect("should read");

    send_command(&mut writer, "disconnect");
    expect_ok(&mut reader, &mut writer);

    stop.stop();
    let _ = accept_thread.join();
}

/// A connection that requires authentication drops silently on a bad token.
#[test_log::test]
fn wire_auth_rejects_bad_token() {
    let folder = tempfile::tempdir().expect("should create tempdir");
    let dir = folder.path();

    let mut config = test_config(dir);
    config.auth_token = Some("sesame".to_owned());

    let factory = Arc::new(
        SearchFactory::new(dir).with_runner_factory(pass_all_runners()),
    );

    let listener = Listener::bind(config, factory).expect("should bind");

    let stop = StopSignal::default();
    let accept_stop = stop.clone();
    let accept_side = Arc::clone(&listener);
    let accept_thread = std::thread::spawn(move || {
        let _ = accept_side.listen(&accept_stop);
    });

    let (control_addr, _) = listener.local_addrs().expect("should resolve");

    let control = TcpStream::connect(control_addr).expect("should connect");
    control
        .set_read_timeout(Some(Duration::from_secs(10)))
        .expect("should set timeout");

    let mut reader = BufReader::new(control.try_clone().expect("should clone"));
    let mut writer = BufWriter::new(control);

    let _session = proto::get_int(&mut reader).expect("should read session id");

    proto::send_string(&mut writer, "auth").expect("should send");
    proto::send_string(&mut writer, "wrong").expect("should send");
    writer.flush().expect("should flush");

    // server hangs up without an answer
    let mut byte = [0u8; 1];
    let got = reader.read(&mut byte);
    assert!(matches!(got, Ok(0)) || got.is_err());

    stop.stop();
    let _ = accept_thread.join();
}
