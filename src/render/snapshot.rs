use std::io::Cursor;

use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
use plotters::prelude::*;

use crate::error::{EngineError, Result};
use crate::render::layout::RenderLayout;

#[derive(Clone, Debug)]
pub struct PlotStyle {
    pub width: u32,
    pub height: u32,
    pub background: RGBColor,
    pub palette: Vec<RGBColor>,
    /// Colour for channels marked bad.
    pub bad_color: RGBColor,
}

impl Default for PlotStyle {
    fn default() -> Self {
        Self {
            width: 1200,
            height: 800,
            background: RGBColor(10, 10, 10),
            palette: vec![BLUE, RED, GREEN, CYAN, MAGENTA, YELLOW, WHITE],
            bad_color: RGBColor(90, 90, 90),
        }
    }
}

/// Draws a stacked-channel layout headlessly and returns PNG bytes.
pub fn render_layout_png(layout: &RenderLayout, style: PlotStyle) -> Result<Vec<u8>> {
    if layout.is_empty() {
        return Err(EngineError::Plot("layout has no traces".into()));
    }
    let mut buffer = vec![0u8; (style.width * style.height * 3) as usize];
    {
        let root = BitMapBackend::with_buffer(&mut buffer, (style.width, style.height))
            .into_drawing_area();
        root.fill(&style.background)?;
        let (y_min, y_max) = layout.y_bounds();
        let x_min = layout.times.first().copied().unwrap_or(0.0);
        let x_max = layout
            .times
            .last()
            .copied()
            .unwrap_or(1.0)
            .max(x_min + f64::EPSILON);
        let mut caption = format!("{:.2}s - {:.2}s  (x{})", x_min, x_max, layout.factor);
        if layout.stale {
            caption.push_str("  [stale]");
        }
        let mut chart = ChartBuilder::on(&root)
            .margin(10)
            .caption(caption, ("sans-serif", 20).into_font().color(&WHITE))
            .set_label_area_size(LabelAreaPosition::Left, 45)
            .set_label_area_size(LabelAreaPosition::Bottom, 40)
            .build_cartesian_2d(x_min..x_max, y_min..y_max)?;
        chart
            .configure_mesh()
            .light_line_style(&WHITE.mix(0.1))
            .draw()?;
        for (idx, trace) in layout.traces.iter().enumerate() {
            let color = if trace.bad {
                style.bad_color
            } else {
                style.palette[idx % style.palette.len()]
            };
            let series = layout
                .times
                .iter()
                .copied()
                .zip(trace.values.iter().copied())
                .filter(|(_, v)| v.is_finite());
            chart
                .draw_series(LineSeries::new(series, &color))?
                .label(trace.label.clone())
                .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &color));
        }
        chart
            .configure_series_labels()
            .border_style(&WHITE.mix(0.2))
            .background_style(&style.background)
            .draw()?;
        root.present()?;
    }
    encode_png(&buffer, style.width, style.height)
}

fn encode_png(buffer: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let image = ImageBuffer::<Rgb<u8>, _>::from_raw(width, height, buffer.to_vec())
        .ok_or_else(|| EngineError::Plot("failed to allocate image buffer".into()))?;
    let mut output = Vec::new();
    let dynamic = DynamicImage::ImageRgb8(image);
    dynamic.write_to(&mut Cursor::new(&mut output), ImageFormat::Png)?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::state::RenderState;
    use crate::signal::window::SampleWindow;
    use ndarray::Array2;

    #[test]
    fn layout_renders_to_png() {
        let values = Array2::from_shape_fn((200, 3), |(r, c)| ((r + c * 7) % 13) as f32);
        let window = SampleWindow::native(100.0, 0, vec![0, 1, 2], values).unwrap();
        let labels = vec!["Fp1".to_string(), "Fp2".to_string(), "TRIG".to_string()];
        let mut state = RenderState::new(labels, 1.0).unwrap();
        state.set_bad(1, true).unwrap();
        let layout = state.compute_layout(&window).unwrap();
        let style = PlotStyle {
            width: 320,
            height: 200,
            ..PlotStyle::default()
        };
        let png = render_layout_png(&layout, style).unwrap();
        assert_eq!(&png[1..4], b"PNG");
    }

    #[test]
    fn empty_layout_is_an_error() {
        let window = SampleWindow::native(100.0, 0, vec![0], Array2::zeros((4, 1))).unwrap();
        let mut state = RenderState::new(vec!["A".into()], 1.0).unwrap();
        state.select(&[]).unwrap();
        let layout = state.compute_layout(&window).unwrap();
        assert!(matches!(
            render_layout_png(&layout, PlotStyle::default()),
            Err(EngineError::Plot(_))
        ));
    }
}
