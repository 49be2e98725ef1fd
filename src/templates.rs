//! Tera rendering of the files this tool owns, plus idempotent file writes.

use std::path::Path;

use log::{debug, info};
use serde::Serialize;
use tera::{Context, Tera};

use crate::error::{BootstrapError, Result};

pub const OVERLAY_UNIT: &str = "flannel.upstart.j2";
pub const LXC_NET: &str = "lxc-net.j2";
pub const LXC_DEFAULT_CONF: &str = "lxc-default.conf.j2";

/// Templates compiled into the binary.
const EMBEDDED_TEMPLATES: &[(&str, &str)] = &[
    (OVERLAY_UNIT, include_str!("../templates/flannel.upstart.j2")),
    (LXC_NET, include_str!("../templates/lxc-net.j2")),
    (LXC_DEFAULT_CONF, include_str!("../templates/lxc-default.conf.j2")),
];

pub struct TemplateRenderer {
    tera: Tera,
}

impl TemplateRenderer {
    pub fn embedded() -> Result<Self> {
        let mut tera = Tera::default();
        tera.add_raw_templates(EMBEDDED_TEMPLATES.iter().copied())
            .map_err(|e| BootstrapError::TemplateRender {
                template: "(embedded)".into(),
                reason: error_chain(&e),
            })?;
        debug!("Loaded {} embedded templates", EMBEDDED_TEMPLATES.len());
        Ok(Self { tera })
    }

    /// Render `template` with the fields of `data`. A variable the template
    /// references but `data` lacks is an error, never an empty string.
    pub fn render<T: Serialize>(&self, template: &str, data: &T) -> Result<String> {
        let render_err = |reason: String| BootstrapError::TemplateRender {
            template: template.to_string(),
            reason,
        };
        let context = Context::from_serialize(data).map_err(|e| render_err(error_chain(&e)))?;
        self.tera
            .render(template, &context)
            .map_err(|e| render_err(error_chain(&e)))
    }
}

/// Tera nests the useful message (e.g. the missing variable) in its sources.
fn error_chain(err: &tera::Error) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Write `contents` to `path` unless it already holds exactly that.
/// Returns whether the file changed.
pub async fn write_if_changed(path: &Path, contents: &str) -> Result<bool> {
    match tokio::fs::read_to_string(path).await {
        Ok(existing) if existing == contents => {
            debug!("{} unchanged", path.display());
            return Ok(false);
        }
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(BootstrapError::io("read", path, e)),
    }

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| BootstrapError::io("create directory", parent, e))?;
    }
    tokio::fs::write(path, contents)
        .await
        .map_err(|e| BootstrapError::io("write", path, e))?;
    info!("Wrote {}", path.display());
    Ok(true)
}
