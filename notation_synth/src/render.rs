// Handing pages to the external handwritten renderer.
//
// The renderer is a separate program. For each page it receives the page
// MusicXML, the domain name, and a seed, and writes two files back: the page
// bitmap (PNG) and a JSON description of where things ended up:
//
//   {
//     "staves": [
//       {"bounds": {"x":..,"y":..,"width":..,"height":..},
//        "glyphs": [{...}, ...],
//        "staff_space": 12.5},
//       ...
//     ],
//     "measure_staff": [0, 0, 0, 1, 1, ...],
//     "page_count": 1
//   }
//
// `measure_staff[i]` is the staff measure `i` was engraved on. The crop
// extractor (`staff.rs`) checks that assignment against the page layout
// instead of trusting it.
//
// The seed is drawn from the run's `SynthRng`, so a fixed run seed renders
// identical pages.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use image::RgbaImage;
use log::debug;
use notation_synth_prng::SynthRng;
use serde::{Deserialize, Serialize};

use crate::error::RenderError;
use crate::page::PageContent;
use crate::tool::run_captured;

/// Axis-aligned box in page pixels.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    /// Smallest box containing both.
    pub fn union(&self, other: &Rect) -> Rect {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        Rect::new(
            x,
            y,
            self.right().max(other.right()) - x,
            self.bottom().max(other.bottom()) - y,
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StaffGeometry {
    /// The five stafflines.
    pub bounds: Rect,
    /// Every glyph drawn for this staff, including ones sticking out of it.
    #[serde(default)]
    pub glyphs: Vec<Rect>,
    /// Distance between two adjacent stafflines in pixels.
    pub staff_space: f64,
}

fn one() -> usize {
    1
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PageGeometry {
    pub staves: Vec<StaffGeometry>,
    pub measure_staff: Vec<usize>,
    #[serde(default = "one")]
    pub page_count: usize,
}

/// A rendered page: bitmap plus the geometry needed to cut it up.
#[derive(Clone, Debug)]
pub struct RenderedPage {
    pub image: RgbaImage,
    pub geometry: PageGeometry,
}

/// Anything that can turn page content into a rendered page.
pub trait PageRenderer {
    fn render(
        &mut self,
        page: &PageContent,
        rng: &mut SynthRng,
    ) -> Result<RenderedPage, RenderError>;
}

/// Runs `<program> [extra_args..] --seed <n> <in.musicxml> <out.png> <out.json> <domain>`.
#[derive(Clone, Debug)]
pub struct CommandRenderer {
    pub program: PathBuf,
    pub extra_args: Vec<String>,
    /// Where the exchange files are written; they are removed after reading.
    pub work_dir: PathBuf,
    pub timeout: Option<Duration>,
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> RenderError + '_ {
    move |source| RenderError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Read back and validate what the renderer wrote.
pub fn load_rendered_page(png: &Path, json: &Path) -> Result<RenderedPage, RenderError> {
    let geometry: PageGeometry =
        serde_json::from_slice(&fs::read(json).map_err(io_error(json))?)?;
    if geometry.page_count != 1 {
        return Err(RenderError::PageCount(geometry.page_count));
    }
    let image = image::open(png)?.to_rgba8();
    Ok(RenderedPage { image, geometry })
}

impl CommandRenderer {
    fn exchange_paths(&self, identifier: &str) -> [PathBuf; 3] {
        [
            self.work_dir.join(format!("{identifier}.musicxml")),
            self.work_dir.join(format!("{identifier}.png")),
            self.work_dir.join(format!("{identifier}.json")),
        ]
    }

    fn run(
        &self,
        page: &PageContent,
        seed: u64,
        paths: &[PathBuf; 3],
    ) -> Result<RenderedPage, RenderError> {
        let [input, png, json] = paths;
        fs::create_dir_all(&self.work_dir).map_err(io_error(&self.work_dir))?;
        fs::write(input, page.musicxml()).map_err(io_error(input))?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.extra_args)
            .arg("--seed")
            .arg(seed.to_string())
            .arg(input)
            .arg(png)
            .arg(json)
            .arg(page.domain());
        let status = run_captured(command, self.timeout).map_err(io_error(&self.program))?;
        if !status.success {
            return Err(RenderError::ToolFailed {
                status: status.status,
                diagnostics: status.diagnostics,
            });
        }
        load_rendered_page(png, json)
    }
}

impl PageRenderer for CommandRenderer {
    fn render(
        &mut self,
        page: &PageContent,
        rng: &mut SynthRng,
    ) -> Result<RenderedPage, RenderError> {
        let seed = rng.next_u64();
        debug!("Rendering {} (seed {seed})", page.identifier());

        let paths = self.exchange_paths(page.identifier());
        let result = self.run(page, seed, &paths);
        for path in &paths {
            let _ = fs::remove_file(path);
        }
        result
    }
}
