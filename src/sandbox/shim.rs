//! Script composition.
//!
//! Submitted code never runs as-is. It is prefixed with a plotting shim and,
//! when it only assigns variables, suffixed with statements that print them.

/// Replaces `matplotlib.pyplot.show` for headless runs.
///
/// Figures with a 3-D axis go to the original `show`; everything else is
/// saved as `plot_<8 hex>.png` in the working directory and closed. The shim
/// is a no-op when matplotlib is not installed.
pub const PLOT_SHIM: &str = r#"import sys
try:
    import uuid as _sandbox_uuid
    import matplotlib.pyplot as _sandbox_plt

    _sandbox_original_show = _sandbox_plt.show

    def _sandbox_show(*args, **kwargs):
        interactive = False
        try:
            for num in _sandbox_plt.get_fignums():
                for ax in _sandbox_plt.figure(num).get_axes():
                    if getattr(ax, "name", "") == "3d":
                        interactive = True
                        break
        except Exception:
            pass

        if interactive:
            print("Interactive plot detected. Opening window...")
            _sandbox_original_show(*args, **kwargs)
        else:
            _sandbox_plt.savefig(f"plot_{_sandbox_uuid.uuid4().hex[:8]}.png")
            _sandbox_plt.close()

    _sandbox_plt.show = _sandbox_show
except ImportError:
    pass
"#;

/// Substrings that mean the code already shows its own results.
const DISPLAY_CALLS: &[&str] = &["print(", "display(", "plt.", ".plot(", ".show(", "savefig("];

/// Builds the script that is actually executed.
#[must_use]
pub fn compose_script(code: &str) -> String {
    let mut script = String::with_capacity(PLOT_SHIM.len() + code.len() + 64);
    script.push_str(PLOT_SHIM);
    script.push('\n');
    script.push_str(code);

    let targets = auto_display_targets(code);
    if !targets.is_empty() {
        if !code.ends_with('\n') {
            script.push('\n');
        }
        for name in targets {
            script.push_str(&format!(
                "try:\n    print(f\"{name} = {{{name}}}\")\nexcept Exception:\n    pass\n"
            ));
        }
    }
    script
}

/// Names assigned at the top level of `code`, in first-seen order.
///
/// Empty when the code contains any display call. Only column-0 statements
/// of the form `name = ...`, `a, b = ...` or `name: T = ...` count;
/// comparisons, augmented assignments and attribute or item targets do not.
#[must_use]
pub fn auto_display_targets(code: &str) -> Vec<String> {
    if DISPLAY_CALLS.iter().any(|call| code.contains(call)) {
        return Vec::new();
    }

    let mut names: Vec<String> = Vec::new();
    for line in code.lines() {
        if line.starts_with(|c: char| c.is_whitespace()) || line.starts_with('#') {
            continue;
        }
        for name in assignment_targets(line) {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
    }
    names
}

fn assignment_targets(line: &str) -> Vec<&str> {
    let Some(eq) = plain_assignment_index(line) else {
        return Vec::new();
    };

    let lhs = line[..eq].trim();
    // `x: int = 5`
    let lhs = lhs.split_once(':').map_or(lhs, |(name, _)| name.trim());
    let lhs = lhs.trim_start_matches('(').trim_end_matches(')');

    let parts: Vec<&str> = lhs.split(',').map(str::trim).filter(|p| !p.is_empty()).collect();
    if parts.is_empty() || !parts.iter().all(|p| is_identifier(p)) {
        return Vec::new();
    }
    parts
}

/// Byte index of the first `=` that is a plain assignment operator.
fn plain_assignment_index(line: &str) -> Option<usize> {
    let bytes = line.as_bytes();
    let eq = line.find('=')?;

    let before = eq.checked_sub(1).map(|i| bytes[i]);
    let after = bytes.get(eq + 1).copied();
    let is_operator_part = matches!(
        before,
        Some(b'=' | b'!' | b'<' | b'>' | b'+' | b'-' | b'*' | b'/' | b'%' | b'&' | b'|' | b'^' | b'@' | b':')
    ) || after == Some(b'=');

    (!is_operator_part).then_some(eq)
}

fn is_identifier(s: &str) -> bool {
    const KEYWORDS: &[&str] = &[
        "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
        "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global",
        "if", "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return",
        "try", "while", "with", "yield",
    ];

    let mut chars = s.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_alphabetic() || first == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
        && !KEYWORDS.contains(&s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_assignment_is_displayed() {
        assert_eq!(auto_display_targets("x = 2 + 2"), vec!["x"]);

        let script = compose_script("x = 2 + 2");
        assert!(script.starts_with(PLOT_SHIM));
        assert!(script.contains("print(f\"x = {x}\")"));
    }

    #[test]
    fn test_explicit_output_disables_display() {
        assert!(auto_display_targets("x = 1\nprint(x)").is_empty());
        assert!(auto_display_targets("import matplotlib.pyplot as plt\ny = [1]\nplt.plot(y)").is_empty());
        assert!(auto_display_targets("df = load()\ndf.plot()").is_empty());
        assert_eq!(compose_script("print('hi')"), format!("{PLOT_SHIM}\nprint('hi')"));
    }

    #[test]
    fn test_tuple_and_annotated_targets() {
        assert_eq!(auto_display_targets("a, b = 1, 2"), vec!["a", "b"]);
        assert_eq!(auto_display_targets("(c, d) = (3, 4)"), vec!["c", "d"]);
        assert_eq!(auto_display_targets("n: int = 5"), vec!["n"]);
    }

    #[test]
    fn test_non_assignments_are_ignored() {
        let code = "\
import numpy as np
if x == 1:
    y = 2
total += 3
obj.attr = 4
items[0] = 5
f(a=1)
z = 6
z = 7
# w = 8
";
        assert_eq!(auto_display_targets(code), vec!["z"]);
    }

    #[test]
    fn test_keywords_are_not_targets() {
        assert!(auto_display_targets("lambda = 1").is_empty());
        assert!(is_identifier("données"));
        assert!(!is_identifier("1abc"));
    }
}
