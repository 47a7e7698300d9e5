pub mod layout;
pub mod overview;
pub mod snapshot;
pub mod state;

pub use layout::{ChannelTrace, RenderLayout};
pub use overview::{overview_y_range, OverviewTrace};
pub use snapshot::{render_layout_png, PlotStyle};
pub use state::{ChannelState, RenderState};
