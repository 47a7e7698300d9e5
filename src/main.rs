// src/main.rs
#![cfg_attr(not(debug_assertions), windows_subsystem = "windows")]
mod gui;

use std::sync::Arc;

use anyhow::Context;
use eframe::egui;
use neurotrace::signal::synthetic::SyntheticMontage;
use neurotrace::{Engine, EngineConfig};

// 配置: 第一个参数为 JSON 配置文件路径, 缺省时使用默认值
fn load_config() -> anyhow::Result<EngineConfig> {
    match std::env::args().nth(1) {
        Some(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config {path}"))?;
            EngineConfig::from_json_str(&text).with_context(|| format!("parsing config {path}"))
        }
        None => Ok(EngineConfig::default()),
    }
}

// 入口函数
fn main() -> anyhow::Result<()> {
    env_logger::init();
    let config = load_config()?;
    let montage = SyntheticMontage::default();
    let source = montage.build().context("building synthetic montage")?;
    log::info!(
        "synthetic montage: {} channels, {} s at {} Hz",
        montage.channels,
        montage.duration_seconds,
        montage.sample_rate
    );
    let engine = Engine::new(Arc::new(source), config).context("starting engine")?;

    let viewport = egui::ViewportBuilder::default()
        .with_inner_size([1463.0, 915.0])
        .with_min_inner_size([1000.0, 640.0])
        .with_title("neurotrace viewer");
    let options = eframe::NativeOptions {
        viewport,
        ..Default::default()
    };
    eframe::run_native(
        "neurotrace",
        options,
        Box::new(move |_cc| Box::new(gui::ViewerApp::new(engine))),
    )
    .map_err(|err| anyhow::anyhow!("viewer failed: {err}"))
}
