//! Project type detection and build recipe templates.

use serde::{Deserialize, Serialize};

use crate::vfs::FileMap;

/// Build recipe file name looked up in the project root.
pub const RECIPE_FILE: &str = "Dockerfile";

/// Closed set of runtime categories a project can be served with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectKind {
    /// Backend manifest present; served by an ASGI server.
    Python,
    /// `package.json` without a UI framework; `npm start`.
    Node,
    /// `package.json` depending on React; Vite dev server.
    React,
    /// Bare markup entry point; nginx.
    Static,
    /// Anything else; falls back to the static template.
    Unknown,
}

impl ProjectKind {
    /// Detects the category from the file set. Pure: depends on nothing but `files`.
    pub fn detect(files: &FileMap) -> Self {
        if files.contains_key("requirements.txt") || files.contains_key("pyproject.toml") {
            return ProjectKind::Python;
        }

        if let Some(manifest) = files.get("package.json") {
            return if depends_on_react(manifest) {
                ProjectKind::React
            } else {
                ProjectKind::Node
            };
        }

        if files.contains_key("index.html") {
            return ProjectKind::Static;
        }

        ProjectKind::Unknown
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectKind::Python => "python",
            ProjectKind::Node => "node",
            ProjectKind::React => "react",
            ProjectKind::Static => "static",
            ProjectKind::Unknown => "unknown",
        }
    }

    /// Build/run template for this category.
    pub fn recipe(&self) -> BuildRecipe {
        match self {
            ProjectKind::Python => BuildRecipe {
                container_port: 8000,
                memory_bytes: 512 * MIB,
                cpus: 0.5,
                dockerfile: PYTHON_DOCKERFILE,
                extra_files: &[],
            },
            ProjectKind::Node => BuildRecipe {
                container_port: 3000,
                memory_bytes: 512 * MIB,
                cpus: 0.5,
                dockerfile: NODE_DOCKERFILE,
                extra_files: &[],
            },
            ProjectKind::React => BuildRecipe {
                container_port: 5173,
                memory_bytes: 512 * MIB,
                cpus: 0.5,
                dockerfile: REACT_DOCKERFILE,
                extra_files: &[],
            },
            ProjectKind::Static | ProjectKind::Unknown => BuildRecipe {
                container_port: 80,
                memory_bytes: 256 * MIB,
                cpus: 0.25,
                dockerfile: STATIC_DOCKERFILE,
                extra_files: &[("nginx.conf", NGINX_CONF)],
            },
        }
    }
}

impl std::fmt::Display for ProjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const MIB: i64 = 1024 * 1024;

/// How a category is built and run.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildRecipe {
    /// Port the guest application listens on inside the container.
    pub container_port: u16,
    /// Memory ceiling in bytes.
    pub memory_bytes: i64,
    /// CPU ceiling in (fractional) cores.
    pub cpus: f64,
    /// Synthesised when the project ships no recipe of its own.
    pub dockerfile: &'static str,
    /// Support files written next to a synthesised recipe.
    pub extra_files: &'static [(&'static str, &'static str)],
}

fn depends_on_react(manifest: &str) -> bool {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(manifest) else {
        tracing::debug!("package.json is not valid JSON, treating as plain node project");
        return false;
    };

    ["dependencies", "devDependencies"].iter().any(|section| {
        value
            .get(section)
            .and_then(|deps| deps.get("react"))
            .is_some()
    })
}

const PYTHON_DOCKERFILE: &str = r#"FROM python:3.12-slim
WORKDIR /app
COPY requirements.txt* pyproject.toml* ./
RUN if [ -f requirements.txt ]; then pip install --no-cache-dir -r requirements.txt; \
    elif [ -f pyproject.toml ]; then pip install --no-cache-dir .; fi
RUN pip install --no-cache-dir uvicorn
COPY . .
EXPOSE 8000
CMD ["uvicorn", "main:app", "--host", "0.0.0.0", "--port", "8000", "--reload"]
"#;

const NODE_DOCKERFILE: &str = r#"FROM node:18-slim
WORKDIR /app
COPY package*.json ./
RUN npm install
COPY . .
EXPOSE 3000
CMD ["npm", "start"]
"#;

const REACT_DOCKERFILE: &str = r#"FROM node:18-slim
WORKDIR /app
COPY package*.json ./
RUN npm install
COPY . .
EXPOSE 5173
CMD ["npm", "run", "dev", "--", "--host", "0.0.0.0", "--port", "5173"]
"#;

const STATIC_DOCKERFILE: &str = r#"FROM nginx:alpine
COPY nginx.conf /etc/nginx/conf.d/default.conf
COPY . /usr/share/nginx/html
EXPOSE 80
"#;

const NGINX_CONF: &str = r#"server {
    listen 80;
    root /usr/share/nginx/html;
    index index.html;
    location / {
        try_files $uri $uri/ /index.html;
    }
}
"#;
