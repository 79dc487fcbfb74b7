//! Integration tests for sensorlink-common.

use sensorlink_common::{
    Format, MeasureItem, MeasurementResult, TopicBuilder, decode_auto, encode, measure_topic,
    parse_config, parse_measure_topic, save_config, BaseConfig,
};

#[test]
fn test_measurement_publish_workflow() {
    let mut result = MeasurementResult::new(0x05, 0x03, "192.168.1.20:8899").with_sensor_id("pond-5");
    result.extend_items([MeasureItem::new("Oxygen", 7.91), MeasureItem::new("Temp", 18.4)]);

    let topic = measure_topic("oxygen");
    assert_eq!(parse_measure_topic(&topic), Some("oxygen"));

    let payload = encode(&result, Format::Json).expect("JSON encode failed");
    let decoded: MeasurementResult = decode_auto(&payload).expect("decode failed");

    assert_eq!(decoded.sensor_id, "pond-5");
    assert_eq!(decoded.device_addr, 0x05);
    assert_eq!(decoded.info_count, 2);
    assert_eq!(decoded.value("Oxygen"), Some(7.91));
    assert_eq!(decoded.node_ip, "192.168.1.20:8899");
}

#[test]
fn test_error_reply_publishes_status_flag() {
    let result = MeasurementResult::new(0x05, 0x83, "dtu-a");
    let payload = encode(&result, Format::Json).unwrap();
    let json: serde_json::Value = serde_json::from_slice(&payload).unwrap();

    assert_eq!(json["status"], 1);
    assert_eq!(json["func_code"], 3);
    assert_eq!(json["info_count"], 0);
}

#[test]
fn test_config_save_then_load() {
    let dir = std::env::temp_dir().join(format!("sensorlink-common-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("base.json5");

    let config: BaseConfig = parse_config(r#"{ zenoh: { mode: "client" } }"#).unwrap();
    let written = save_config(&config, &path).unwrap();
    assert!(written > 0);

    let loaded: BaseConfig = sensorlink_common::load_config(&path).unwrap();
    assert_eq!(loaded.zenoh.mode, "client");

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_topic_builder_default_prefix() {
    let topics = TopicBuilder::default();
    assert_eq!(topics.command_key(), "sensorlink/dtu/@/commands/sensor");
}
