// src/gui.rs
use std::sync::mpsc::Receiver;
use std::time::Duration;

use eframe::egui;
use egui::Color32;
use egui_plot::{Line, Plot, PlotImage, PlotPoint, PlotPoints, VLine};

use neurotrace::engine::OVERVIEW_POINTS;
use neurotrace::render::OverviewTrace;
use neurotrace::signal::synthetic::TRIGGER_CHANNEL;
use neurotrace::signal::{
    ChannelStats, FilterKind, Pipeline, PowerSpectrum, ProcessingStage, Spectrogram, TimeRange,
};
use neurotrace::{Engine, EngineEvent, RenderLayout, TriggerEvent};

const PALETTE: [Color32; 6] = [
    Color32::from_rgb(0, 255, 255),
    Color32::YELLOW,
    Color32::from_rgb(255, 0, 255),
    Color32::from_rgb(120, 255, 120),
    Color32::from_rgb(255, 160, 60),
    Color32::from_rgb(150, 150, 255),
];
const BAD_COLOR: Color32 = Color32::from_rgb(90, 90, 90);
const TRIGGER_COLOR: Color32 = Color32::from_rgb(255, 80, 80);
const PEAK_COLOR: Color32 = Color32::from_rgb(0, 255, 255);

const BANDS: [(&str, f32, f32); 5] = [
    ("delta", 1.0, 4.0),
    ("theta", 4.0, 8.0),
    ("alpha", 8.0, 13.0),
    ("beta", 13.0, 30.0),
    ("gamma", 30.0, 45.0),
];
/// Colour range of the spectrogram below its strongest bin.
const SPECTROGRAM_DYNAMIC_DB: f32 = 60.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CentralView {
    Traces,
    Spectrum,
    Spectrogram,
    Stats,
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct AnalysisKey {
    view: CentralView,
    channel: usize,
    range: TimeRange,
}

enum AnalysisResult {
    Spectrum(PowerSpectrum),
    Spectrogram {
        sg: Spectrogram,
        texture: Option<egui::TextureHandle>,
    },
    Stats(ChannelStats),
}

// 分析结果缓存: 视图/通道/范围不变时不重算
struct Analysis {
    key: AnalysisKey,
    result: Option<AnalysisResult>,
}

pub struct ViewerApp {
    engine: Engine,
    events: Receiver<EngineEvent>,

    // 当前布局与刷新状态
    layout: Option<RenderLayout>,
    last_range: Option<TimeRange>,
    last_budget: usize,
    needs_refresh: bool,

    // 概览
    overview: Option<OverviewTrace>,
    overview_channel: usize,

    // 显示设置
    base_scale: f32,
    remove_dc: bool,
    notch_50: bool,

    // 触发检测
    trigger_channel: usize,
    trigger_threshold: f32,
    refractory_secs: f64,
    triggers: Vec<TriggerEvent>,

    // 标注
    annotation_label: String,

    // 频谱分析
    central_view: CentralView,
    analysis_channel: usize,
    analysis: Option<Analysis>,

    // 界面日志
    log_messages: Vec<String>,
}

impl ViewerApp {
    pub fn new(engine: Engine) -> Self {
        let events = engine.subscribe();
        let last_channel = engine.render_state().channel_count().saturating_sub(1);
        let base_scale = engine.render_state().base_scale();
        Self {
            engine,
            events,
            layout: None,
            last_range: None,
            last_budget: 0,
            needs_refresh: true,
            overview: None,
            overview_channel: TRIGGER_CHANNEL.min(last_channel),
            base_scale,
            remove_dc: false,
            notch_50: false,
            trigger_channel: TRIGGER_CHANNEL.min(last_channel),
            trigger_threshold: 1.0,
            refractory_secs: 1.0,
            triggers: Vec::new(),
            annotation_label: "Event".to_owned(),
            central_view: CentralView::Traces,
            analysis_channel: 0,
            analysis: None,
            log_messages: vec!["neurotrace viewer ready.".to_owned()],
        }
    }

    fn log(&mut self, msg: &str) {
        self.log_messages.push(format!("> {}", msg));
        if self.log_messages.len() > 8 {
            self.log_messages.remove(0);
        }
    }

    fn report<T>(&mut self, what: &str, result: neurotrace::Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                self.log(&format!("{what}: {err}"));
                None
            }
        }
    }

    // 引擎事件
    fn drain_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                EngineEvent::LayoutInvalidated => {
                    self.needs_refresh = true;
                    self.analysis = None;
                }
                EngineEvent::TierReady { .. } => self.needs_refresh = true,
                EngineEvent::AnnotationsChanged => {}
                EngineEvent::SourceUnavailable(reason) => {
                    self.log(&format!("Source lost: {reason}"))
                }
                EngineEvent::SourceReattached => {
                    self.overview = None;
                    self.analysis = None;
                    self.needs_refresh = true;
                }
            }
        }
    }

    // 键盘导航
    fn handle_keys(&mut self, ctx: &egui::Context) {
        let pressed = |key| ctx.input(|i| i.key_pressed(key));
        let view = self.engine.viewport_mut();
        if pressed(egui::Key::ArrowRight) {
            view.half_step_forward();
        }
        if pressed(egui::Key::ArrowLeft) {
            view.half_step_back();
        }
        if pressed(egui::Key::PageDown) {
            view.step_forward();
        }
        if pressed(egui::Key::PageUp) {
            view.step_back();
        }
        if pressed(egui::Key::ArrowUp) {
            view.zoom_in();
        }
        if pressed(egui::Key::ArrowDown) {
            view.zoom_out();
        }
        if pressed(egui::Key::Home) {
            view.go_to_start();
        }
        if pressed(egui::Key::End) {
            view.go_to_end();
        }
        if pressed(egui::Key::F) {
            view.zoom_to_full();
        }
    }

    fn refresh_layout(&mut self, budget: usize) {
        let range = self.engine.viewport().range();
        let moved = self.last_range != Some(range) || self.last_budget != budget;
        if !(self.needs_refresh || moved) {
            return;
        }
        self.needs_refresh = false;
        self.last_range = Some(range);
        self.last_budget = budget;
        let result = self.engine.request_viewport(budget);
        if let Some(layout) = self.report("Window", result) {
            self.layout = Some(layout);
        }
    }

    fn refresh_overview(&mut self) {
        if self.overview.is_some() {
            return;
        }
        let result = self.engine.overview(self.overview_channel, OVERVIEW_POINTS);
        self.overview = self.report("Overview", result);
    }

    fn refresh_analysis(&mut self, ctx: &egui::Context) {
        if self.central_view == CentralView::Traces {
            return;
        }
        let key = AnalysisKey {
            view: self.central_view,
            channel: self.analysis_channel,
            range: self.engine.viewport().range(),
        };
        if self.analysis.as_ref().is_some_and(|a| a.key == key) {
            return;
        }
        let result = match key.view {
            CentralView::Spectrum => {
                let result = self.engine.power_spectrum(key.channel, key.range);
                self.report("Spectrum", result).map(AnalysisResult::Spectrum)
            }
            CentralView::Spectrogram => {
                let result = self.engine.spectrogram(key.channel, key.range);
                self.report("Spectrogram", result).map(|sg| {
                    let texture = (!sg.is_empty()).then(|| {
                        ctx.load_texture(
                            "spectrogram",
                            spectrogram_image(&sg),
                            egui::TextureOptions::NEAREST,
                        )
                    });
                    AnalysisResult::Spectrogram { sg, texture }
                })
            }
            CentralView::Stats => {
                let result = self.engine.channel_stats(key.channel, key.range);
                self.report("Stats", result).map(AnalysisResult::Stats)
            }
            CentralView::Traces => None,
        };
        self.analysis = Some(Analysis { key, result });
    }

    fn apply_processing(&mut self) {
        let mut stages = Vec::new();
        if self.remove_dc {
            stages.push(ProcessingStage::RemoveDc);
        }
        if self.notch_50 {
            stages.push(ProcessingStage::Filter(vec![FilterKind::Notch {
                freq_hz: 50.0,
                q: 30.0,
            }]));
        }
        let pipeline = Pipeline::new(stages);
        self.log(&format!("Processing: {}", pipeline.describe()));
        self.engine.set_pipeline(pipeline);
    }

    fn detect(&mut self) {
        let result = self.engine.detect_triggers(
            self.trigger_channel,
            self.trigger_threshold,
            self.refractory_secs,
            None,
        );
        if let Some(events) = self.report("Detect", result) {
            self.log(&format!("{} triggers found", events.len()));
            self.triggers = events;
        }
    }

    fn toggle_selection(&mut self, channel: usize) {
        let mut selection = self.engine.render_state().selection().to_vec();
        match selection.iter().position(|&c| c == channel) {
            Some(pos) => {
                selection.remove(pos);
            }
            None => selection.push(channel),
        }
        let result = self.engine.select_channels(&selection);
        self.report("Select", result);
    }

    fn annotate_view(&mut self) {
        let range = self.engine.viewport().range();
        let rate = self.engine.sample_rate();
        let start = (range.start * rate).round() as u64;
        let end = (range.end * rate).round() as u64;
        let label = self.annotation_label.clone();
        let result = self.engine.add_annotation(start, end, label);
        self.report("Annotate", result);
    }

    fn side_panel(&mut self, ui: &mut egui::Ui) {
        ui.add_space(10.0);
        ui.heading("neurotrace");
        ui.label(format!(
            "{} channels · {:.0} s @ {} Hz",
            self.engine.render_state().channel_count(),
            self.engine.duration_seconds(),
            self.engine.sample_rate()
        ));
        ui.separator();

        // 导航
        ui.horizontal(|ui| {
            let view = self.engine.viewport_mut();
            if ui.button("|<").clicked() {
                view.go_to_start();
            }
            if ui.button("<<").clicked() {
                view.step_back();
            }
            if ui.button("<").clicked() {
                view.half_step_back();
            }
            if ui.button(">").clicked() {
                view.half_step_forward();
            }
            if ui.button(">>").clicked() {
                view.step_forward();
            }
            if ui.button(">|").clicked() {
                view.go_to_end();
            }
        });
        ui.horizontal(|ui| {
            let view = self.engine.viewport_mut();
            if ui.button("Zoom +").clicked() {
                view.zoom_in();
            }
            if ui.button("Zoom -").clicked() {
                view.zoom_out();
            }
            if ui.button("Full").clicked() {
                view.zoom_to_full();
            }
        });

        // 显示
        ui.add_space(10.0);
        ui.label("DISPLAY");
        if ui
            .add(egui::Slider::new(&mut self.base_scale, 0.05..=50.0).logarithmic(true).text("scale"))
            .changed()
        {
            let result = self.engine.set_base_scale(self.base_scale);
            self.report("Scale", result);
        }
        let dc = ui.checkbox(&mut self.remove_dc, "Remove DC").changed();
        let notch = ui.checkbox(&mut self.notch_50, "50 Hz notch").changed();
        if dc || notch {
            self.apply_processing();
        }

        // 通道列表
        ui.horizontal(|ui| {
            let count = self.engine.render_state().channel_count();
            if ui.button("All").clicked() {
                let all: Vec<usize> = (0..count).collect();
                let result = self.engine.select_channels(&all);
                self.report("Select", result);
            }
            if ui.button("First 16").clicked() {
                let first: Vec<usize> = (0..count.min(16)).collect();
                let result = self.engine.select_channels(&first);
                self.report("Select", result);
            }
        });
        let state = self.engine.render_state();
        let rows: Vec<(usize, String, bool, bool, bool, f32)> = state
            .channels()
            .iter()
            .enumerate()
            .map(|(idx, ch)| {
                let selected = state.selection().contains(&idx);
                let scale = ch.scale.unwrap_or(state.base_scale());
                (idx, ch.label.clone(), selected, ch.visible, ch.bad, scale)
            })
            .collect();
        egui::ScrollArea::vertical()
            .id_source("channels")
            .max_height(220.0)
            .show(ui, |ui| {
                for (idx, label, selected, mut visible, bad, mut scale) in rows {
                    ui.horizontal(|ui| {
                        if ui.selectable_label(selected, "sel").clicked() {
                            self.toggle_selection(idx);
                        }
                        if ui.checkbox(&mut visible, label).changed() {
                            let result = self.engine.set_visible(idx, visible);
                            self.report("Visible", result);
                        }
                        if ui.selectable_label(bad, "bad").clicked() {
                            let result = self.engine.set_bad(idx, !bad);
                            self.report("Bad", result);
                        }
                        let drag = egui::DragValue::new(&mut scale)
                            .speed(0.05)
                            .clamp_range(0.01..=100.0);
                        if ui.add(drag).changed() {
                            let result = self.engine.set_channel_scale(idx, scale);
                            self.report("Scale", result);
                        }
                    });
                }
            });

        // 触发检测
        ui.separator();
        ui.label("TRIGGERS");
        let last_channel = self.engine.render_state().channel_count().saturating_sub(1);
        ui.horizontal(|ui| {
            ui.label("ch");
            ui.add(egui::DragValue::new(&mut self.trigger_channel).clamp_range(0..=last_channel));
            ui.label("thr");
            ui.add(egui::DragValue::new(&mut self.trigger_threshold).speed(0.05));
            ui.label("refr s");
            ui.add(
                egui::DragValue::new(&mut self.refractory_secs)
                    .speed(0.05)
                    .clamp_range(0.0..=60.0),
            );
        });
        ui.horizontal(|ui| {
            if ui.button("Detect").clicked() {
                self.detect();
            }
            if ui.button("Reset").clicked() {
                self.engine.reset_detector();
                self.triggers.clear();
            }
        });
        let mut jump = None;
        egui::ScrollArea::vertical()
            .id_source("triggers")
            .max_height(100.0)
            .show(ui, |ui| {
                for event in &self.triggers {
                    let text = format!("#{} @ {:.3} s", event.sample_index, event.time_seconds);
                    if ui.link(text).clicked() {
                        jump = Some(event.time_seconds);
                    }
                }
            });

        // 标注
        ui.separator();
        ui.label("ANNOTATIONS");
        ui.horizontal(|ui| {
            ui.text_edit_singleline(&mut self.annotation_label);
            if ui.button("Annotate view").clicked() {
                self.annotate_view();
            }
        });
        let rate = self.engine.sample_rate();
        let listed: Vec<(u64, String, f64)> = self
            .engine
            .annotations()
            .iter()
            .map(|a| (a.id, a.label.clone(), a.start_sample as f64 / rate))
            .collect();
        let mut remove = None;
        egui::ScrollArea::vertical()
            .id_source("annotations")
            .max_height(100.0)
            .show(ui, |ui| {
                for (id, label, start) in &listed {
                    ui.horizontal(|ui| {
                        if ui.link(format!("{label} @ {start:.2} s")).clicked() {
                            jump = Some(*start);
                        }
                        if ui.small_button("x").clicked() {
                            remove = Some(*id);
                        }
                    });
                }
            });
        if let Some(id) = remove {
            let result = self.engine.remove_annotation(id);
            self.report("Remove", result);
        }
        if let Some(t) = jump {
            self.engine.viewport_mut().center_on(t);
        }

        // 缓存状态与日志
        ui.separator();
        let stats = self.engine.cache_stats();
        ui.label(
            egui::RichText::new(format!(
                "cache: {} tiles, {:.1}/{:.1} M samples, {} building",
                stats.tiles,
                stats.total_samples as f64 / 1e6,
                stats.budget_samples as f64 / 1e6,
                stats.in_flight
            ))
            .small(),
        );
        egui::ScrollArea::vertical()
            .id_source("log")
            .max_height(100.0)
            .show(ui, |ui| {
                for m in &self.log_messages {
                    ui.monospace(m);
                }
            });
    }

    fn overview_panel(&mut self, ui: &mut egui::Ui) {
        let Some(overview) = &self.overview else {
            ui.label("Overview unavailable.");
            return;
        };
        let points: Vec<[f64; 2]> = overview
            .times
            .iter()
            .zip(&overview.values)
            .map(|(t, v)| [*t, *v as f64])
            .collect();
        let (lo, hi) = overview.y_range;
        let view = self.engine.viewport().range();
        let response = Plot::new("overview_plot")
            .allow_drag(false)
            .allow_zoom(false)
            .allow_scroll(false)
            .allow_boxed_zoom(false)
            .include_y(lo as f64)
            .include_y(hi as f64)
            .auto_bounds_x()
            .show(ui, |plot_ui| {
                plot_ui.line(Line::new(PlotPoints::new(points)).color(Color32::LIGHT_GRAY));
                plot_ui.vline(VLine::new(view.start).color(Color32::YELLOW));
                plot_ui.vline(VLine::new(view.end).color(Color32::YELLOW));
                plot_ui.pointer_coordinate()
            });
        // 点击概览: 保持跨度, 居中到点击位置
        if response.response.clicked() {
            if let Some(point) = response.inner {
                self.engine.viewport_mut().center_on(point.x);
            }
        }
    }

    fn view_tabs(&mut self, ui: &mut egui::Ui) {
        let last_channel = self.engine.render_state().channel_count().saturating_sub(1);
        ui.horizontal(|ui| {
            ui.selectable_value(&mut self.central_view, CentralView::Traces, "Traces");
            ui.selectable_value(&mut self.central_view, CentralView::Spectrum, "PSD");
            ui.selectable_value(&mut self.central_view, CentralView::Spectrogram, "Spectrogram");
            ui.selectable_value(&mut self.central_view, CentralView::Stats, "Stats");
            if self.central_view != CentralView::Traces {
                ui.separator();
                ui.label("ch");
                ui.add(
                    egui::DragValue::new(&mut self.analysis_channel).clamp_range(0..=last_channel),
                );
                if let Some(ch) = self.engine.render_state().channel(self.analysis_channel) {
                    ui.label(ch.label.as_str());
                }
            }
        });
    }

    fn analysis_panel(&self, ui: &mut egui::Ui) {
        let Some(analysis) = &self.analysis else {
            ui.label("Loading...");
            return;
        };
        let range = analysis.key.range;
        ui.label(format!("{:.2}-{:.2} s, processed native samples", range.start, range.end));
        match &analysis.result {
            None => {
                ui.label("No analysis for this view.");
            }
            Some(AnalysisResult::Spectrum(psd)) => spectrum_plot(ui, psd),
            Some(AnalysisResult::Spectrogram { sg, texture }) => {
                spectrogram_plot(ui, sg, texture.as_ref(), range)
            }
            Some(AnalysisResult::Stats(stats)) => stats_grid(ui, stats),
        }
    }

    fn trace_plot(&mut self, ui: &mut egui::Ui) {
        let Some(layout) = &self.layout else {
            ui.label("Loading...");
            return;
        };
        ui.horizontal(|ui| {
            ui.label(format!(
                "{:.2}-{:.2} s · factor {} ({:?}) · {} points",
                layout.range.start,
                layout.range.end,
                layout.factor,
                layout.reduction,
                layout.point_count()
            ));
            if layout.provisional {
                ui.label(egui::RichText::new("refining...").color(Color32::YELLOW));
            }
            if layout.stale {
                ui.label(egui::RichText::new("STALE DATA").strong().color(Color32::RED));
            }
            if layout.clipped.is_some() {
                ui.label(egui::RichText::new("clipped").small());
            }
        });

        let range = layout.range;
        let rate = self.engine.sample_rate();
        let marks: Vec<(f64, f64, Color32, String)> = self
            .engine
            .annotations_in(range)
            .unwrap_or_default()
            .into_iter()
            .map(|a| {
                let [r, g, b] = a.color;
                (
                    a.start_sample as f64 / rate,
                    a.end_sample as f64 / rate,
                    Color32::from_rgb(r, g, b),
                    a.label.clone(),
                )
            })
            .collect();
        let triggers: Vec<f64> = self
            .triggers
            .iter()
            .map(|e| e.time_seconds)
            .filter(|t| *t >= range.start && *t < range.end)
            .collect();

        Plot::new("trace_plot")
            .allow_drag(false)
            .allow_zoom(false)
            .allow_scroll(false)
            .allow_boxed_zoom(false)
            .auto_bounds_x()
            .auto_bounds_y()
            .show(ui, |plot_ui| {
                for trace in &layout.traces {
                    let color = if trace.bad {
                        BAD_COLOR
                    } else {
                        PALETTE[trace.slot % PALETTE.len()]
                    };
                    let points: Vec<[f64; 2]> = layout
                        .times
                        .iter()
                        .zip(&trace.values)
                        .map(|(t, v)| [*t, *v as f64])
                        .collect();
                    plot_ui.line(
                        Line::new(PlotPoints::new(points))
                            .name(&trace.label)
                            .color(color),
                    );
                }
                for t in &triggers {
                    plot_ui.vline(VLine::new(*t).color(TRIGGER_COLOR));
                }
                for (start, end, color, label) in &marks {
                    plot_ui.vline(VLine::new(*start).color(*color).name(label));
                    plot_ui.vline(VLine::new(*end).color(*color));
                }
            });
    }
}

impl eframe::App for ViewerApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        // 1. 输入与事件
        self.handle_keys(ctx);
        self.drain_events();
        self.refresh_overview();

        // 2. UI 绘制
        let mut visuals = egui::Visuals::dark();
        visuals.widgets.noninteractive.bg_fill = Color32::from_rgb(10, 10, 15);
        ctx.set_visuals(visuals);

        egui::SidePanel::left("L")
            .min_width(300.0)
            .show(ctx, |ui| self.side_panel(ui));

        egui::TopBottomPanel::bottom("overview")
            .exact_height(140.0)
            .show(ctx, |ui| self.overview_panel(ui));

        egui::CentralPanel::default().show(ctx, |ui| {
            self.view_tabs(ui);
            if self.central_view == CentralView::Traces {
                let budget = ui.available_width().max(100.0) as usize;
                self.refresh_layout(budget);
                self.trace_plot(ui);
            } else {
                self.refresh_analysis(ctx);
                self.analysis_panel(ui);
            }
        });

        // 3. 后台构建中: 轮询 TierReady
        if self.layout.as_ref().is_some_and(|l| l.provisional) || self.engine.cache_stats().in_flight > 0 {
            ctx.request_repaint_after(Duration::from_millis(30));
        }
    }
}

// ============================================================
// 频谱视图
// ============================================================

fn spectrum_plot(ui: &mut egui::Ui, psd: &PowerSpectrum) {
    ui.horizontal(|ui| {
        if let Some(peak) = psd.peak_frequency() {
            ui.label(format!("peak {peak:.2} Hz"));
        }
        for (name, lo, hi) in BANDS {
            ui.label(egui::RichText::new(format!("{name} {:.3}", psd.band_power(lo, hi))).small());
        }
    });
    let points: Vec<[f64; 2]> = psd
        .frequencies_hz
        .iter()
        .zip(psd.to_db())
        .map(|(f, db)| [*f as f64, db as f64])
        .collect();
    Plot::new("psd_plot")
        .x_axis_label("Hz")
        .y_axis_label("dB")
        .show(ui, |plot_ui| {
            plot_ui.line(Line::new(PlotPoints::new(points)).color(PALETTE[0]));
        });
}

fn spectrogram_plot(
    ui: &mut egui::Ui,
    sg: &Spectrogram,
    texture: Option<&egui::TextureHandle>,
    range: TimeRange,
) {
    let Some(texture) = texture else {
        ui.label("Window too short for a spectrogram.");
        return;
    };
    let top_hz = sg.frequencies_hz.last().copied().unwrap_or(0.0) as f64;
    let hop = match sg.times_s.as_slice() {
        [a, b, ..] => b - a,
        _ => range.duration(),
    };
    let first = sg.times_s.first().copied().unwrap_or(range.start) - hop / 2.0;
    let last = sg.times_s.last().copied().unwrap_or(range.end) + hop / 2.0;
    let peaks: Vec<[f64; 2]> = (0..sg.frames())
        .filter_map(|frame| {
            let peak = sg.peak_frequency(frame)?;
            Some([sg.times_s[frame], peak as f64])
        })
        .collect();
    Plot::new("spectrogram_plot")
        .x_axis_label("s")
        .y_axis_label("Hz")
        .include_x(first)
        .include_x(last)
        .include_y(0.0)
        .include_y(top_hz)
        .show(ui, |plot_ui| {
            plot_ui.image(PlotImage::new(
                texture,
                PlotPoint::new((first + last) / 2.0, top_hz / 2.0),
                [(last - first) as f32, top_hz as f32],
            ));
            plot_ui.line(Line::new(PlotPoints::new(peaks)).color(PEAK_COLOR).name("peak"));
        });
}

/// Frames run left to right, frequency bottom to top.
fn spectrogram_image(sg: &Spectrogram) -> egui::ColorImage {
    let db = sg.to_db();
    let hi = db.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let lo = hi - SPECTROGRAM_DYNAMIC_DB;
    let (frames, bins) = (sg.frames(), sg.bins());
    let mut pixels = Vec::with_capacity(frames * bins);
    for bin in (0..bins).rev() {
        for frame in 0..frames {
            pixels.push(heat((db[[frame, bin]] - lo) / SPECTROGRAM_DYNAMIC_DB));
        }
    }
    egui::ColorImage {
        size: [frames, bins],
        pixels,
    }
}

// 黑 -> 紫 -> 橙 -> 黄
fn heat(v: f32) -> Color32 {
    let v = v.clamp(0.0, 1.0);
    let r = (v * 1.8).min(1.0);
    let g = ((v - 0.45) * 1.8).clamp(0.0, 1.0);
    let b = (v * 2.5).min(1.0) * (1.0 - v) + ((v - 0.85) * 4.0).max(0.0);
    Color32::from_rgb((r * 255.0) as u8, (g * 255.0) as u8, (b.min(1.0) * 255.0) as u8)
}

fn stats_grid(ui: &mut egui::Ui, stats: &ChannelStats) {
    let rows = [
        ("mean", stats.mean),
        ("std", stats.std_dev),
        ("rms", stats.rms),
        ("median", stats.median),
        ("p25", stats.p25),
        ("p75", stats.p75),
        ("min", stats.min),
        ("max", stats.max),
    ];
    egui::Grid::new("stats_grid")
        .num_columns(2)
        .striped(true)
        .show(ui, |ui| {
            for (name, value) in rows {
                ui.label(name);
                ui.monospace(format!("{value:>12.4}"));
                ui.end_row();
            }
        });
}
