//! briefmatch - match creative briefs to ad-production portfolios.
//!
//! Each portfolio is described by five factors (`full`, `desc`, `what`,
//! `how`, `style`). The builder extracts them with an LLM, embeds each one,
//! and fuses the unit vectors into a single vector scaled by `sqrt(weight)`,
//! so one inner-product query approximates the weighted multi-factor
//! similarity. Queries retrieve candidates from the fused index, rescore
//! them exactly per factor, and optionally diversify with MMR.
//!
//! # Quick start
//!
//! ```no_run
//! use briefmatch::{DataDir, FusedSearchEngine, RankService, Settings};
//! use briefmatch::factor::ExtractedFactors;
//! use briefmatch::rank::RankLimits;
//!
//! let data_dir = DataDir::resolve(None).unwrap();
//! let settings = Settings::resolve(None).unwrap();
//! let engine =
//!     FusedSearchEngine::open(&data_dir.artifacts_db(), settings.search_tuning())
//!         .unwrap();
//! let service = RankService::new(engine, None, RankLimits::from(&settings));
//!
//! let factors = ExtractedFactors {
//!     desc: "a calm skincare film".to_string(),
//!     what: "cosmetics".to_string(),
//!     how: "video".to_string(),
//!     style: "minimal".to_string(),
//! };
//! let response = service.rank_factors(factors, None, false).unwrap();
//! for r in &response.results {
//!     println!("#{} {} (score: {:.3})", r.id, r.name, r.final_score);
//! }
//! ```

pub mod artifact;
pub mod artifact_db;
pub mod builder;
pub mod chat;
pub mod cli;
pub mod config;
pub mod config_db;
pub mod data_dir;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod extraction;
pub mod factor;
pub mod flat_index;
pub mod mcp;
pub mod mmr;
pub mod model_manager;
pub mod rank;
pub mod rate_limiter;
pub mod record;
pub mod studio_stats;
pub mod vector;

pub use artifact::ArtifactBundle;
pub use builder::FusionIndexBuilder;
pub use config::Settings;
pub use config_db::ConfigDb;
pub use data_dir::DataDir;
pub use engine::FusedSearchEngine;
pub use error::{Error, Result};
pub use extraction::FactorExtractor;
pub use model_manager::ModelManager;
pub use rank::RankService;
