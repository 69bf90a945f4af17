use std::fmt;
use std::io;
use std::time::SystemTime;

use crate::response::GeneratedOn;
use crate::sys::{DirEntry, FileSystemOps};
use crate::util::{HtmlEscaped, ShortDate, UrlEncoded};

/// Directory listing table.
struct Listing(Vec<DirEntry>);

impl fmt::Display for Listing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "<table>")?;
        writeln!(
            f,
            "<tr><th>Name</th><th>Last modified</th><th>Size</th></tr>"
        )?;
        writeln!(
            f,
            "<tr><td><a href=\"../\">../</a></td><td></td><td>-</td></tr>"
        )?;
        for entry in &self.0 {
            let slash = if entry.is_dir { "/" } else { "" };
            write!(
                f,
                "<tr><td><a href=\"{}{}\">{}{}</a></td><td>{}</td>",
                UrlEncoded(&entry.name),
                slash,
                HtmlEscaped(&entry.name),
                slash,
                ShortDate(entry.stat.modified),
            )?;
            if entry.is_dir {
                writeln!(f, "<td>-</td></tr>")?;
            } else {
                writeln!(f, "<td>{}</td></tr>", entry.stat.size)?;
            }
        }
        writeln!(f, "</table>")
    }
}

/// HTML index of the directory `dir`, titled with the request path.
pub fn generate_listing<F: FileSystemOps>(
    fs: &F,
    dir: &str,
    uri_path: &str,
    now: SystemTime,
) -> io::Result<String> {
    let mut entries = fs.read_directory(dir)?;
    entries.retain(|entry| entry.name != "." && entry.name != "..");
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(format!(
        "<html>\n<head>\n<title>Index of {}</title>\n\
        <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n\
        </head>\n<body>\n<h1>Index of {}</h1>\n\
        {}\
        <hr>\n\
        {}\
        </body>\n</html>\n",
        HtmlEscaped(uri_path),
        HtmlEscaped(uri_path),
        Listing(entries),
        GeneratedOn(now),
    ))
}
