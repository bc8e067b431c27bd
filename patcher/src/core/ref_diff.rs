//! Reference diff parsing for delta mode.

/// Files touched by a unified diff, in the order their `+++ ` headers appear.
///
/// A leading `b/` is stripped, `/dev/null` targets (deletions) are skipped and
/// trailing tab-separated timestamps are removed. A path that appears in
/// several file sections is listed once per section.
pub fn changed_files(diff: &str) -> Vec<String> {
    let mut files: Vec<String> = Vec::new();
    for line in diff.lines() {
        let Some(rest) = line.strip_prefix("+++ ") else {
            continue;
        };
        let path = rest.split('\t').next().unwrap_or_default().trim();
        if path.is_empty() || path == "/dev/null" {
            continue;
        }
        let path = path.strip_prefix("b/").unwrap_or(path);
        files.push(path.to_string());
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_changed_files_in_order() {
        let diff = "\
--- a/foo.c
+++ b/foo.c
@@ -1 +1 @@
-a
+b
--- a/bar.c
+++ b/bar.c
@@ -1 +1 @@
-c
+d
";
        assert_eq!(changed_files(diff), vec!["foo.c", "bar.c"]);
    }

    #[test]
    fn skips_deletions_and_strips_timestamps() {
        let diff = "\
--- a/gone.c
+++ /dev/null
--- lib/x.c\t2024-01-01 00:00:00.000000000 +0000
+++ lib/x.c\t2024-01-02 00:00:00.000000000 +0000
";
        assert_eq!(changed_files(diff), vec!["lib/x.c"]);
    }

    #[test]
    fn repeated_sections_keep_their_order() {
        let diff = "\
--- a/foo.c
+++ b/foo.c
@@ -1,2 +1,2 @@
+++++ added line
--- a/bar.c
+++ b/bar.c
@@ -1 +1 @@
-x
+y
--- a/foo.c
+++ b/foo.c
@@ -9 +9 @@
-z
+w
";
        assert_eq!(changed_files(diff), vec!["foo.c", "bar.c", "foo.c"]);
    }

    #[test]
    fn empty_diff_has_no_files() {
        assert!(changed_files("").is_empty());
    }
}
