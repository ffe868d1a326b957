//! Runtime template written into a freshly initialized project:
//! the dependency manifest plus the minimal entry files the dev server needs.

use std::collections::BTreeMap;

use serde_json::{json, Value};

/// Dependencies every project starts with. Request dependencies override these.
const BASE_DEPENDENCIES: &[(&str, &str)] = &[
    ("react", "^18.2.0"),
    ("react-dom", "^18.2.0"),
    ("react-scripts", "^5.0.1"),
    ("react-router-dom", "^6.23.0"),
    ("typescript", "^5.5.0"),
    ("@types/react", "^18.2.0"),
    ("@types/react-dom", "^18.2.0"),
];

pub const INDEX_JS: &str = r#"import React from 'react';
import ReactDOM from 'react-dom/client';
import App from './App';

const root = ReactDOM.createRoot(document.getElementById('root'));
root.render(<App />);
"#;

pub const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8" />
  <meta name="viewport" content="width=device-width, initial-scale=1" />
  <title>Dynamic React App</title>
</head>
<body>
  <div id="root"></div>
</body>
</html>
"#;

/// Build `package.json` for a project.
pub fn package_json(name: &str, extra: &BTreeMap<String, String>) -> Value {
    let mut deps: BTreeMap<String, String> = BASE_DEPENDENCIES
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    for (k, v) in extra {
        deps.insert(k.clone(), v.clone());
    }

    let browsers = json!([
        "last 1 Chrome version",
        "last 1 Firefox version",
        "last 1 Safari version"
    ]);

    json!({
        "name": name.to_ascii_lowercase(),
        "version": "0.1.0",
        "private": true,
        "dependencies": deps,
        "scripts": {
            "start": "react-scripts start",
            "build": "react-scripts build"
        },
        "eslintConfig": { "extends": ["react-app", "react-app/jest"] },
        "browserslist": {
            "production": browsers.clone(),
            "development": browsers
        }
    })
}

pub fn tsconfig_json() -> Value {
    json!({
        "compilerOptions": {
            "target": "ES2020",
            "lib": ["DOM", "ES2020"],
            "jsx": "react-jsx",
            "module": "ESNext",
            "moduleResolution": "Node",
            "skipLibCheck": true,
            "esModuleInterop": true,
            "forceConsistentCasingInFileNames": true,
            "strict": false,
            "noEmit": true
        },
        "include": ["src"]
    })
}

/// Pick the entry component file name. Only `App.jsx`/`App.tsx`/`App.js`/`App.ts` are accepted.
pub fn entry_file_name(requested: Option<&str>) -> &'static str {
    match requested.map(|s| s.trim().trim_start_matches("src/")) {
        Some("App.tsx") => "App.tsx",
        Some("App.ts") => "App.ts",
        Some("App.js") => "App.js",
        _ => "App.jsx",
    }
}

pub fn is_typescript(path: &str) -> bool {
    path.ends_with(".ts") || path.ends_with(".tsx")
}
