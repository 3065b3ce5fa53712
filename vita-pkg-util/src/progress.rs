/// Trait for receiving extraction progress updates.
///
/// Every method has a no-op default, so implementors only override what they
/// display.
pub trait ExtractProgress {
    /// Called before an item is written. `index` counts from zero.
    fn item_start(&self, _path: &str, _index: u32, _total: u32) {}

    /// Called when an item has no place in the output.
    fn item_skipped(&self, _name: &str, _reason: &str) {}

    /// Called when a disc image of `blocks` blocks starts.
    fn image_start(&self, _path: &str, _blocks: u32) {}

    /// Called after each block of the current disc image.
    fn image_block(&self, _done: u32) {}

    /// Called once the output is finished.
    fn completed(&self, _bytes: u64) {}
}

/// A no-op progress implementation that discards all updates.
pub struct SilentProgress;

impl ExtractProgress for SilentProgress {}

impl<P: ExtractProgress + ?Sized> ExtractProgress for &P {
    fn item_start(&self, path: &str, index: u32, total: u32) {
        (**self).item_start(path, index, total);
    }

    fn item_skipped(&self, name: &str, reason: &str) {
        (**self).item_skipped(name, reason);
    }

    fn image_start(&self, path: &str, blocks: u32) {
        (**self).image_start(path, blocks);
    }

    fn image_block(&self, done: u32) {
        (**self).image_block(done);
    }

    fn completed(&self, bytes: u64) {
        (**self).completed(bytes);
    }
}

/// Console progress reporter.
///
/// Items are printed one per line. Disc images get an indicatif progress bar
/// that redraws at a fixed rate.
#[cfg(feature = "cli")]
pub struct ConsoleProgress {
    image_bar: indicatif::ProgressBar,
}

#[cfg(feature = "cli")]
impl ConsoleProgress {
    pub fn new() -> Self {
        Self {
            image_bar: indicatif::ProgressBar::hidden(),
        }
    }
}

#[cfg(feature = "cli")]
impl Default for ConsoleProgress {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "cli")]
impl ExtractProgress for ConsoleProgress {
    fn item_start(&self, path: &str, index: u32, total: u32) {
        println!("[{}/{total}] {path}", index + 1);
    }

    fn image_start(&self, _path: &str, blocks: u32) {
        self.image_bar
            .set_draw_target(indicatif::ProgressDrawTarget::stderr());
        self.image_bar.set_length(u64::from(blocks));
        self.image_bar.set_position(0);
        if let Ok(style) = indicatif::ProgressStyle::default_bar()
            .template("{bar:40.cyan/blue} {pos}/{len} blocks [{elapsed_precise}]")
        {
            self.image_bar.set_style(style.progress_chars("━╸─"));
        }
        self.image_bar.reset();
    }

    fn image_block(&self, done: u32) {
        self.image_bar.set_position(u64::from(done));
        if self.image_bar.length() == Some(u64::from(done)) {
            self.image_bar.finish_and_clear();
        }
    }

    fn completed(&self, bytes: u64) {
        println!("Done ({bytes} bytes).");
    }
}
