pub mod data;
pub mod loaders;

// Re-export common types
pub use data::{
    load_dataset_config, BatchError, DataLoaderBatch, DatasetConfig, FileItem, FileItemDataset,
    FileItemOverrides, ImageCrateProbe, ImageSizeProbe, LoadContext, SizeCache,
};
pub use loaders::{AdapterFlags, BaseModel, LcmAdapter, LoraAdapter, ModelConfig};

pub mod logging {
    use env_logger::{Builder, Env};
    use std::io::Write;

    /// Initialise the global logger. `RUST_LOG` overrides the default `info` level.
    pub fn init_logger() {
        Builder::from_env(Env::default().default_filter_or("info"))
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} [{}] - {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.args()
                )
            })
            .init();
    }
}
