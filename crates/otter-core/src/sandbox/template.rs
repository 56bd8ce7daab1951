//! Template materialization.
//!
//! A template tag names a small on-disk tree under the configured
//! templates directory. When that tree is missing the sandbox falls back
//! to a built-in minimal tree, so the pipeline works from a bare checkout.

use std::path::Path;

use crate::model::Template;

use super::{SandboxError, copy_tree};

/// Built-in file set for a template: `(relative path, content)` pairs.
pub fn builtin_files(template: Template) -> &'static [(&'static str, &'static str)] {
    match template {
        Template::React => REACT_FILES,
        Template::Express => EXPRESS_FILES,
        Template::Flask => FLASK_FILES,
        Template::Generic => GENERIC_FILES,
    }
}

/// Materialize `template` into `dest`.
///
/// Prefers the on-disk tree at `<templates_dir>/<template>/`; falls back
/// to the built-in tree when it does not exist.
pub fn materialize(
    template: Template,
    templates_dir: Option<&Path>,
    dest: &Path,
) -> Result<(), SandboxError> {
    if let Some(dir) = templates_dir {
        let src = dir.join(template.dir_name());
        if src.is_dir() {
            tracing::debug!(template = %template, src = %src.display(), "materializing on-disk template");
            return copy_tree(&src, dest);
        }
    }

    tracing::debug!(template = %template, "materializing built-in template");
    for (rel_path, content) in builtin_files(template) {
        let target = dest.join(rel_path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SandboxError::io("create", parent, e))?;
        }
        std::fs::write(&target, content).map_err(|e| SandboxError::io("write", &target, e))?;
    }
    Ok(())
}

const REACT_FILES: &[(&str, &str)] = &[
    (
        "package.json",
        r#"{
  "name": "calculator-demo",
  "version": "1.0.0",
  "scripts": {
    "test": "node src/calculator.test.js"
  }
}
"#,
    ),
    (
        "src/calculator.js",
        r#"class Calculator {
  add(a, b) {
    return a + b;
  }

  subtract(a, b) {
    return a - b;
  }
}

export default Calculator;
"#,
    ),
    (
        "src/calculator.test.js",
        r#"import Calculator from './calculator.js';

const calc = new Calculator();
if (calc.add(2, 3) !== 5) {
  throw new Error('add(2, 3) should be 5');
}
console.log('calculator smoke test passed');
"#,
    ),
];

const EXPRESS_FILES: &[(&str, &str)] = &[
    (
        "package.json",
        r#"{
  "name": "express-demo",
  "version": "1.0.0",
  "scripts": {
    "test": "node src/app.test.js"
  },
  "dependencies": {
    "express": "^4.18.2"
  }
}
"#,
    ),
    (
        "src/app.js",
        r#"const express = require('express');

const app = express();
const port = process.env.PORT || 3000;

app.get('/', (req, res) => {
  res.json({ message: 'Hello World' });
});

app.listen(port, () => {
  console.log(`Server running on port ${port}`);
});

module.exports = app;
"#,
    ),
    (
        "src/app.test.js",
        r#"const app = require('./app');

if (typeof app.listen !== 'function') {
  throw new Error('app should be an express application');
}
console.log('app smoke test passed');
"#,
    ),
];

const FLASK_FILES: &[(&str, &str)] = &[
    (
        "app.py",
        r#"from flask import Flask, jsonify, request

app = Flask(__name__)


@app.get('/')
def root():
    return jsonify({'message': 'Hello World'})


if __name__ == '__main__':
    app.run(debug=True)
"#,
    ),
    (
        "test_app.py",
        r#"import pytest
from app import app


@pytest.fixture()
def client():
    app.config['TESTING'] = True
    with app.test_client() as c:
        yield c


def test_root(client):
    r = client.get('/')
    assert r.status_code == 200
    assert r.get_json()['message'] == 'Hello World'
"#,
    ),
    ("requirements.txt", "flask\npytest\n"),
];

const GENERIC_FILES: &[(&str, &str)] = &[
    (
        "main.py",
        r#"def add(a, b):
    return a + b


if __name__ == "__main__":
    print(add(2, 3))
"#,
    ),
    (
        "test_main.py",
        r#"from main import add


def test_add():
    assert add(2, 3) == 5
"#,
    ),
];
