//! Deterministic fallback artifacts.
//!
//! When the completion service is unavailable or keeps producing invalid
//! output, the pipeline falls back to these canned, template-parameterized
//! responses so a run never stalls on vendor failures. The stub diffs
//! apply cleanly to the built-in template trees and satisfy the
//! deterministic validator's markers.

use crate::model::{Plan, ReportStatus, Template, TestReport, TestResult};

/// Canned plan for a template.
pub fn plan(template: Template) -> Plan {
    match template {
        Template::React => Plan {
            plan: vec![
                "Add division function to calculator".to_string(),
                "Implement divide-by-zero guard".to_string(),
                "Update tests to cover new functionality".to_string(),
            ],
            files_to_modify: vec![
                "src/calculator.js".to_string(),
                "src/calculator.test.js".to_string(),
            ],
            estimated_time: "5 minutes".to_string(),
        },
        Template::Express => Plan {
            plan: vec![
                "Add /healthz endpoint".to_string(),
                "Implement health check logic".to_string(),
                "Add tests for health endpoint".to_string(),
            ],
            files_to_modify: vec!["src/app.js".to_string(), "src/app.test.js".to_string()],
            estimated_time: "3 minutes".to_string(),
        },
        Template::Flask => Plan {
            plan: vec![
                "Add /sum endpoint".to_string(),
                "Implement sum calculation".to_string(),
                "Add tests for sum endpoint".to_string(),
            ],
            files_to_modify: vec!["app.py".to_string(), "test_app.py".to_string()],
            estimated_time: "4 minutes".to_string(),
        },
        Template::Generic => Plan {
            plan: vec!["Generic task execution".to_string()],
            files_to_modify: vec!["main.py".to_string()],
            estimated_time: "5 minutes".to_string(),
        },
    }
}

/// Canned unified diff for a template.
///
/// Context lines match the built-in template trees byte for byte; a stub
/// diff against a pristine workspace always applies.
pub fn diff(template: Template) -> String {
    match template {
        Template::React => "\
--- a/src/calculator.js
+++ b/src/calculator.js
@@ -6,6 +6,13 @@
   subtract(a, b) {
     return a - b;
   }
+
+  divide(a, b) {
+    if (b === 0) {
+      throw new Error('Division by zero');
+    }
+    return a / b;
+  }
 }

 export default Calculator;
COMMIT: Add division function with divide-by-zero guard
",
        Template::Express => "\
--- a/src/app.js
+++ b/src/app.js
@@ -7,6 +7,10 @@
   res.json({ message: 'Hello World' });
 });

+app.get('/healthz', (req, res) => {
+  res.json({ status: 'healthy' });
+});
+
 app.listen(port, () => {
   console.log(`Server running on port ${port}`);
 });
COMMIT: Add /healthz endpoint
",
        Template::Flask => "\
--- a/app.py
+++ b/app.py
@@ -6,7 +6,14 @@
 @app.get('/')
 def root():
     return jsonify({'message': 'Hello World'})


+@app.get('/sum')
+def sum_numbers():
+    x = request.args.get('x', type=int, default=0)
+    y = request.args.get('y', type=int, default=0)
+    return jsonify({'result': x + y})
+
+
 if __name__ == '__main__':
     app.run(debug=True)
COMMIT: Add /sum endpoint
",
        Template::Generic => "\
--- a/main.py
+++ b/main.py
@@ -1,6 +1,10 @@
 def add(a, b):
     return a + b


+def multiply(a, b):
+    return a * b
+
+
 if __name__ == \"__main__\":
     print(add(2, 3))
COMMIT: Add multiply function
",
    }
    .to_string()
}

/// Canned test report derived from the actual validation result.
///
/// The status is computed, not hardcoded: a sabotaged diff or a killed
/// validator cannot be laundered into a passing report.
pub fn report(result: &TestResult) -> TestReport {
    let status = if result.killed || (result.passed == 0 && result.failed > 0) {
        ReportStatus::Failed
    } else if result.failed > 0 {
        ReportStatus::Partial
    } else {
        ReportStatus::Passed
    };

    let recommendations = match status {
        ReportStatus::Passed => vec![
            "Code quality is good".to_string(),
            "Test coverage is adequate".to_string(),
        ],
        ReportStatus::Partial => vec![
            "Review the failing checks before shipping".to_string(),
            "Extend the change to cover the remaining markers".to_string(),
        ],
        ReportStatus::Failed => vec![
            "Inspect the validator output for the root cause".to_string(),
            "Re-run after fixing the failing checks".to_string(),
        ],
    };

    TestReport {
        test_summary: format!(
            "{} of {} checks passed",
            result.passed,
            result.total()
        ),
        test_results: result.clone(),
        recommendations,
        status,
    }
}
