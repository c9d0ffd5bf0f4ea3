//! Optimizer processes launched from the bridge configuration

#![cfg(unix)]

use simlink_bridge::Bridge;
use simlink_core::{BridgeConfig, OptimizerProcessConfig, SimLinkError};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

fn scratch(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("simlink-{}-{}", name, std::process::id()))
}

fn with_optimizer(command: &str, args: Vec<String>) -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.endpoint.address = "tcp://127.0.0.1:0".into();
    config.optimizers.push(OptimizerProcessConfig {
        name: "scripted".into(),
        command: command.into(),
        args,
        ..Default::default()
    });
    config
}

fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in {:?}", WAIT);
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_optimizer_sees_bound_address_and_dies_with_bridge() {
    let out = scratch("address");
    let _ = std::fs::remove_file(&out);
    let script = format!("printf %s \"$SIMLINK_ADDRESS\" > '{}'; exec sleep 30", out.display());
    let bridge = Bridge::start(with_optimizer("sh", vec!["-c".into(), script])).unwrap();

    let expected = bridge.local_endpoint().unwrap().to_string();
    assert!(!expected.ends_with(":0"));
    wait_until(|| std::fs::read_to_string(&out).is_ok_and(|got| got == expected));

    let optimizer = &bridge.optimizers()[0];
    assert_eq!(optimizer.name(), "scripted");
    assert!(optimizer.is_running());
    let pid = optimizer.pid().unwrap();

    bridge.shutdown();
    if cfg!(target_os = "linux") {
        assert!(!std::path::Path::new(&format!("/proc/{}", pid)).exists());
    }
    let _ = std::fs::remove_file(&out);
}

#[test]
fn test_optimizer_environment_and_working_dir() {
    let dir = scratch("workdir");
    std::fs::create_dir_all(&dir).unwrap();
    let mut config = with_optimizer("sh", vec!["-c".into(), "printf %s \"$STRATEGY\" > strategy".into()]);
    config.optimizers[0].env.insert("STRATEGY".into(), "greedy".into());
    config.optimizers[0].working_dir = Some(dir.clone());
    let bridge = Bridge::start(config).unwrap();

    let out = dir.join("strategy");
    wait_until(|| std::fs::read_to_string(&out).is_ok_and(|got| got == "greedy"));
    wait_until(|| !bridge.optimizers()[0].is_running());

    bridge.shutdown();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_missing_optimizer_binary_fails_start() {
    let config = with_optimizer("/nonexistent/simlink-optimizer", Vec::new());
    assert!(matches!(Bridge::start(config), Err(SimLinkError::FatalInit(_))));
}
