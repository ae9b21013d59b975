use anyhow::anyhow;

/// handle --push-state/--pop-state
#[derive(Debug, Copy, Clone)]
struct OptStack {
    /// --as-needed
    pub as_needed: bool,
    /// -static
    pub link_static: bool,
}

#[derive(Debug, Clone)]
pub struct FileOpt {
    pub name: String,
    /// --as-needed
    pub as_needed: bool,
}

#[derive(Debug, Clone)]
pub struct LibraryOpt {
    pub name: String,
    /// --as-needed
    pub as_needed: bool,
    /// -static
    pub link_static: bool,
}

#[derive(Debug, Clone)]
pub enum ObjectFileOpt {
    /// ObjectFile
    File(FileOpt),
    /// -l namespec
    Library(LibraryOpt),
    /// --start-group
    StartGroup,
    /// --end-group
    EndGroup,
}

#[derive(Debug, Clone)]
pub struct Opt {
    /// --build-id
    pub build_id: bool,
    /// -pie
    pub pie: bool,
    /// -shared
    pub shared: bool,
    /// -z now
    pub z_now: bool,
    /// -e entry
    pub entry: String,
    /// -rpath dir, joined with ':'
    pub rpaths: String,
    /// -m emulation
    pub emulation: Option<String>,
    /// -o output
    pub output: Option<String>,
    /// -dynamic-linker
    pub dynamic_linker: Option<String>,
    /// -soname
    pub soname: Option<String>,
    /// -L searchdir
    pub search_dir: Vec<String>,
    /// ObjectFile
    pub obj_file: Vec<ObjectFileOpt>,
}

impl Default for Opt {
    fn default() -> Self {
        Self {
            build_id: false,
            pie: false,
            shared: false,
            z_now: false,
            entry: "_start".to_string(),
            rpaths: String::new(),
            emulation: None,
            output: None,
            dynamic_linker: None,
            soname: None,
            search_dir: vec![],
            obj_file: vec![],
        }
    }
}

/// parse arguments
pub fn parse_opts(args: &Vec<String>) -> anyhow::Result<Opt> {
    let mut opt = Opt::default();
    let mut cur_opt_stack = OptStack {
        as_needed: false,
        link_static: false,
    };
    let mut opt_stack = vec![];
    let mut rpaths = vec![];
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            // single dash
            s @ _ if s.starts_with("-L") => {
                // library search path argument
                opt.search_dir
                    .push(s.strip_prefix("-L").unwrap().to_string());
            }
            "-dynamic-linker" | "--dynamic-linker" => {
                // dynamic linker argument
                opt.dynamic_linker = Some(
                    iter.next()
                        .ok_or(anyhow!("Missing dynamic linker after -dynamic-linker"))?
                        .to_string(),
                );
            }
            "-e" | "--entry" => {
                // entry symbol argument
                opt.entry = iter
                    .next()
                    .ok_or(anyhow!("Missing symbol after -e"))?
                    .to_string();
            }
            s @ _ if s.starts_with("-l") => {
                // library argument
                opt.obj_file.push(ObjectFileOpt::Library(LibraryOpt {
                    name: s.strip_prefix("-l").unwrap().to_string(),
                    as_needed: cur_opt_stack.as_needed,
                    link_static: cur_opt_stack.link_static,
                }));
            }
            "-m" => {
                // emulation argument
                opt.emulation = Some(
                    iter.next()
                        .ok_or(anyhow!("Missing emulation after -m"))?
                        .to_string(),
                );
            }
            "-o" => {
                // output argument
                opt.output = Some(
                    iter.next()
                        .ok_or(anyhow!("Missing output after -o"))?
                        .to_string(),
                );
            }
            "-pie" | "--pie" => {
                opt.pie = true;
            }
            "-plugin" => {
                // skip plugin argument
                iter.next();
            }
            s @ _ if s.starts_with("-plugin-opt=") => {
                // ignored
            }
            "-rpath" | "--rpath" => {
                rpaths.push(
                    iter.next()
                        .ok_or(anyhow!("Missing directory after -rpath"))?
                        .to_string(),
                );
            }
            "-shared" => {
                opt.shared = true;
            }
            "-soname" | "--soname" => {
                opt.soname = Some(
                    iter.next()
                        .ok_or(anyhow!("Missing name after -soname"))?
                        .to_string(),
                );
            }
            "-static" => {
                cur_opt_stack.link_static = true;
            }
            "-z" => {
                // keyword argument
                match iter.next().map(|s| s.as_str()) {
                    Some("now") => opt.z_now = true,
                    Some(_) => {}
                    None => return Err(anyhow!("Missing keyword after -z")),
                }
            }

            // double dashes
            "--as-needed" => {
                cur_opt_stack.as_needed = true;
            }
            "--build-id" => {
                opt.build_id = true;
            }
            "--end-group" => {
                opt.obj_file.push(ObjectFileOpt::EndGroup);
            }
            "--start-group" => {
                opt.obj_file.push(ObjectFileOpt::StartGroup);
            }
            "--pop-state" => {
                cur_opt_stack = opt_stack.pop().unwrap();
            }
            "--push-state" => {
                opt_stack.push(cur_opt_stack);
            }
            // end of known flags
            s @ _ if s.starts_with("-") => {
                // unknown flag
                return Err(anyhow!("Unknown argument: {s}"));
            }
            s @ _ => {
                // object file argument
                opt.obj_file.push(ObjectFileOpt::File(FileOpt {
                    name: s.to_string(),
                    as_needed: cur_opt_stack.as_needed,
                }));
            }
        }
    }
    opt.rpaths = rpaths.join(":");
    Ok(opt)
}
