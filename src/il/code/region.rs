use super::Label;
use crate::il::type_graph::TypeId;
use crate::il::Error;

/// Opaque handle to an open protected block or handler
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub struct Region(u32);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegionKind<'g> {
    /// Protected block
    Try,

    /// Handler for exceptions assignable to the type
    Catch(TypeId<'g>),

    /// Block deciding whether the `catch` handler following it should run
    Filter,

    /// Handler that runs only when the protected block exits with an exception
    Fault,

    /// Handler that runs however the protected block exits
    Finally,
}

impl<'g> RegionKind<'g> {
    pub fn is_handler(&self) -> bool {
        !matches!(self, RegionKind::Try)
    }
}

#[derive(Clone, Debug)]
pub struct OpenRegion<'g> {
    pub region: Region,
    pub kind: RegionKind<'g>,

    /// Protected block this region belongs to (itself, for `Try`)
    pub try_region: Region,

    /// Label right after the whole try construct (shared by the try and its handlers)
    pub end_label: Label,

    /// Number of handlers opened so far (only tracked for `Try`)
    handlers: usize,

    /// A filter has ended and the `catch` it guards hasn't started (only tracked for `Try`)
    awaiting_filter_handler: bool,

    /// There is a `finally` or `fault` handler, which can't share the try with others
    has_exclusive_handler: bool,
}

/// Information needed to start a handler
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct HandlerEntry {
    pub end_label: Label,

    /// The protected block itself ends when this handler starts
    pub ends_protected_block: bool,
}

/// Stack of open exception regions
///
/// Regions close in LIFO order. Handlers are opened while their `Try` is the innermost region, and
/// the `Try` itself is closed after all of its handlers:
///
/// ```text
/// Try ─┬─ body
///      ├─ Catch(T) ... end_region(catch)
///      ├─ Filter ... end_region(filter), Catch(T) ... end_region(catch)
///      └─ end_region(try)
/// ```
#[derive(Default)]
pub struct RegionTracker<'g> {
    open: Vec<OpenRegion<'g>>,
    next_region: u32,
}

impl<'g> RegionTracker<'g> {
    pub fn new() -> RegionTracker<'g> {
        RegionTracker {
            open: vec![],
            next_region: 0,
        }
    }

    fn fresh_region(&mut self) -> Region {
        let region = Region(self.next_region);
        self.next_region += 1;
        region
    }

    pub fn innermost(&self) -> Option<&OpenRegion<'g>> {
        self.open.last()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    /// Nearest enclosing handler (skipping over protected blocks nested inside of it)
    pub fn enclosing_handler(&self) -> Option<RegionKind<'g>> {
        self.open
            .iter()
            .rev()
            .map(|open| open.kind)
            .find(RegionKind::is_handler)
    }

    /// Open a protected block
    ///
    /// Blocks can't start between the handlers of another protected block.
    pub fn begin_try(&mut self, end_label: Label) -> Result<Region, Error> {
        if let Some(open) = self.open.last() {
            if open.kind == RegionKind::Try && open.handlers > 0 {
                return Err(Error::InvalidRegionNesting(format!(
                    "{:?} already has handlers, so nothing else can be nested in it",
                    open.region
                )));
            }
        }
        let region = self.fresh_region();
        self.open.push(OpenRegion {
            region,
            kind: RegionKind::Try,
            try_region: region,
            end_label,
            handlers: 0,
            awaiting_filter_handler: false,
            has_exclusive_handler: false,
        });
        Ok(region)
    }

    fn innermost_try(&self, try_region: Region) -> Result<&OpenRegion<'g>, Error> {
        match self.open.last() {
            Some(open) if open.region == try_region && open.kind == RegionKind::Try => Ok(open),
            Some(open) => Err(Error::InvalidRegionNesting(format!(
                "handlers for {:?} must start directly inside of it, but {:?} ({:?}) is open",
                try_region, open.region, open.kind
            ))),
            None => Err(Error::InvalidRegionNesting(format!(
                "{:?} is not open",
                try_region
            ))),
        }
    }

    /// Check that a handler of the given kind can start now
    pub fn check_handler(
        &self,
        try_region: Region,
        kind: RegionKind<'g>,
    ) -> Result<HandlerEntry, Error> {
        let open = self.innermost_try(try_region)?;
        let exclusive = matches!(kind, RegionKind::Finally | RegionKind::Fault);

        if !kind.is_handler() {
            return Err(Error::InvalidRegionNesting(String::from(
                "a protected block is not a handler",
            )));
        }
        if open.awaiting_filter_handler && !matches!(kind, RegionKind::Catch(_)) {
            return Err(Error::InvalidRegionNesting(format!(
                "the filter of {:?} must be followed by its catch handler",
                try_region
            )));
        }
        if open.has_exclusive_handler || (exclusive && open.handlers > 0) {
            return Err(Error::InvalidRegionNesting(format!(
                "a finally or fault handler must be the only handler of {:?}",
                try_region
            )));
        }

        Ok(HandlerEntry {
            end_label: open.end_label,
            ends_protected_block: open.handlers == 0,
        })
    }

    /// Open a handler for the innermost protected block
    pub fn begin_handler(
        &mut self,
        try_region: Region,
        kind: RegionKind<'g>,
    ) -> Result<Region, Error> {
        let entry = self.check_handler(try_region, kind)?;
        let region = self.fresh_region();
        if let Some(open) = self.open.last_mut() {
            open.handlers += 1;
            open.awaiting_filter_handler = false;
            open.has_exclusive_handler |= matches!(kind, RegionKind::Finally | RegionKind::Fault);
        }
        self.open.push(OpenRegion {
            region,
            kind,
            try_region,
            end_label: entry.end_label,
            handlers: 0,
            awaiting_filter_handler: false,
            has_exclusive_handler: false,
        });
        Ok(region)
    }

    /// Check that the region is the innermost one and can be closed now
    pub fn check_end(&self, region: Region) -> Result<&OpenRegion<'g>, Error> {
        let open = match self.open.last() {
            Some(open) if open.region == region => open,
            Some(open) => {
                return Err(Error::InvalidRegionNesting(format!(
                    "cannot close {:?} while {:?} ({:?}) is still open inside it",
                    region, open.region, open.kind
                )))
            }
            None => {
                return Err(Error::InvalidRegionNesting(format!(
                    "cannot close {:?}: no region is open",
                    region
                )))
            }
        };

        if open.kind == RegionKind::Try {
            if open.handlers == 0 {
                return Err(Error::InvalidRegionNesting(format!(
                    "{:?} has no handlers",
                    region
                )));
            }
            if open.awaiting_filter_handler {
                return Err(Error::InvalidRegionNesting(format!(
                    "the filter of {:?} has no catch handler",
                    region
                )));
            }
        }
        Ok(open)
    }

    /// Close the innermost region
    pub fn end_region(&mut self, region: Region) -> Result<OpenRegion<'g>, Error> {
        self.check_end(region)?;
        let closed = self
            .open
            .pop()
            .ok_or_else(|| Error::InvalidRegionNesting(format!("{:?} is not open", region)))?;
        if closed.kind == RegionKind::Filter {
            if let Some(parent) = self.open.last_mut() {
                parent.awaiting_filter_handler = true;
            }
        }
        Ok(closed)
    }
}
